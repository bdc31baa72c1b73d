//! Post-handler audit hook.
//!
//! [`audit`] runs the handler first and then hands one [`AuditRecord`] per request to
//! an [`AuditHook`]. Formatting and persistence of the trail are up to the hook.

use crate::middleware::principal::Principal;
use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Outcome of one request as seen after the handler ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub elapsed_ms: u64,
}

pub trait AuditHook: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits each record as one structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditHook;

impl AuditHook for TracingAuditHook {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "tablekeeper::audit",
            method = %record.method,
            path = %record.path,
            status = record.status,
            user_id = ?record.user_id,
            elapsed_ms = record.elapsed_ms,
            "Request completed"
        );
    }
}

/// Middleware invoking the audit hook after the handler.
pub async fn audit(
    State(hook): State<Arc<dyn AuditHook>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let user_id = request
        .extensions()
        .get::<Principal>()
        .map(|principal| principal.user_id);

    let response = next.run(request).await;

    hook.record(&AuditRecord {
        method,
        path,
        status: response.status().as_u16(),
        user_id,
        elapsed_ms: started.elapsed().as_millis() as u64,
    });
    response
}
