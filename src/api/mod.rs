//! HTTP API surface.
//!
//! Routes are grouped per concern; [`router`] assembles them with the principal
//! and audit layers.

pub mod access;
pub mod pools;

use crate::db::PoolManager;
use crate::middleware::{AuditHook, audit, trusted_principal};
use crate::permissions::PermissionEngine;
use axum::{
    Json, Router,
    extract::State,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub pools: Arc<PoolManager>,
    pub engine: Arc<PermissionEngine>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Options for assembling the router.
#[derive(Clone)]
pub struct RouterOptions {
    pub audit_hook: Arc<dyn AuditHook>,
    /// Install the trusted-header principal adapter.
    pub trust_principal_headers: bool,
}

/// Build the application router.
pub fn router(state: AppState, options: RouterOptions) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .merge(pools::router())
        .merge(access::router(&state))
        .layer(from_fn_with_state(options.audit_hook, audit));

    let app = if options.trust_principal_headers {
        app.layer(from_fn(trusted_principal))
    } else {
        app
    };
    app.with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "pools": state.pools.pool_count().await,
        "pending_creations": state.pools.pending_creations().await,
    }))
}
