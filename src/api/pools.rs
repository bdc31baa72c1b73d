//! Pool introspection endpoints (admin only).
//!
//! - `GET /admin/pools`: statistics for every registered pool
//! - `GET /admin/pools/{database}`: statistics for one pool
//! - `POST /admin/pools/{database}/reconnect`: close and recreate one pool

use crate::api::AppState;
use crate::db::PoolStats;
use crate::error::{DbError, DbResult};
use crate::middleware::require_admin;
use axum::{
    Json, Router,
    extract::{Path, State},
    middleware::from_fn,
    routing::{get, post},
};
use std::collections::BTreeMap;
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/pools", get(list_pools))
        .route("/admin/pools/{database}", get(pool_stats))
        .route("/admin/pools/{database}/reconnect", post(reconnect_pool))
        .route_layer(from_fn(require_admin))
}

async fn list_pools(State(state): State<AppState>) -> Json<BTreeMap<String, PoolStats>> {
    Json(state.pools.pool_stats().await)
}

async fn pool_stats(
    State(state): State<AppState>,
    Path(database): Path<String>,
) -> DbResult<Json<PoolStats>> {
    state.pools.pool_stats_for(&database).await.map(Json)
}

async fn reconnect_pool(
    State(state): State<AppState>,
    Path(database): Path<String>,
) -> DbResult<Json<PoolStats>> {
    let timeout = state.request_timeout;
    let handle = tokio::time::timeout(timeout, state.pools.reconnect(&database))
        .await
        .map_err(|_| {
            DbError::timeout(
                format!("reconnecting pool '{}'", database),
                u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX),
            )
        })??;
    info!(database = %database, handle_id = %handle.id(), "Pool reconnected via API");
    Ok(Json(handle.stats()))
}
