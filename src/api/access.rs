//! Caller-facing permission endpoints.
//!
//! - `GET /me/permissions`: every grant the caller holds
//! - `GET /me/databases`: databases the caller can read
//! - `GET /databases/{database}/access[?table=]`: the caller's effective flags,
//!   guarded by READ on the named database (or table)

use crate::api::AppState;
use crate::error::DbResult;
use crate::middleware::{PermissionGuard, PermissionTarget, Principal, enforce};
use crate::permissions::{PermissionSet, SqlPermissionStore, UserPermissions};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::Request,
    middleware::from_fn_with_state,
    routing::get,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct AccessQuery {
    table: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccessResponse {
    database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    permissions: PermissionSet,
}

pub fn router(state: &AppState) -> Router<AppState> {
    let read_guard = PermissionGuard::require_dynamic(state.engine.clone(), read_target);

    let guarded = Router::new()
        .route("/databases/{database}/access", get(effective_access))
        .route_layer(from_fn_with_state(read_guard, enforce::<SqlPermissionStore>));

    Router::new()
        .route("/me/permissions", get(my_permissions))
        .route("/me/databases", get(my_databases))
        .merge(guarded)
}

/// READ on `/databases/{database}/access`, narrowed to `?table=` when present.
///
/// The segment is percent-decoded the same way the `Path` extractor decodes it, so
/// the guard checks the database the handler reports.
fn read_target(request: &Request<Body>) -> Option<PermissionTarget> {
    let mut segments = request.uri().path().trim_matches('/').split('/');
    let database = match (segments.next(), segments.next()) {
        (Some("databases"), Some(name)) if !name.is_empty() => {
            percent_decode_str(name).decode_utf8().ok()?
        }
        _ => return None,
    };
    let table = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "table")
            .map(|(_, value)| value.into_owned())
    });
    Some(PermissionTarget::new("READ", database, table.as_deref()))
}

async fn my_permissions(
    State(state): State<AppState>,
    principal: Principal,
) -> DbResult<Json<UserPermissions>> {
    state.engine.user_permissions(principal.user_id).await.map(Json)
}

async fn my_databases(
    State(state): State<AppState>,
    principal: Principal,
) -> DbResult<Json<Vec<String>>> {
    state
        .engine
        .accessible_databases(principal.user_id)
        .await
        .map(Json)
}

async fn effective_access(
    State(state): State<AppState>,
    principal: Principal,
    Path(database): Path<String>,
    Query(query): Query<AccessQuery>,
) -> Json<AccessResponse> {
    let permissions = if principal.is_admin {
        PermissionSet {
            read: true,
            write: true,
            delete: true,
            create: true,
        }
    } else {
        state
            .engine
            .effective_permissions(principal.user_id, &database, query.table.as_deref())
            .await
    };
    Json(AccessResponse {
        database,
        table: query.table,
        permissions,
    })
}
