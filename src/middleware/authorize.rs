//! Authorization guards for HTTP routes.
//!
//! A [`PermissionGuard`] describes what a route requires (one permission, all of a
//! list, any of a list, or a permission derived from the request) and is attached
//! with `axum::middleware::from_fn_with_state(guard, enforce::<S>)`.
//!
//! Admin principals pass every guard without the engine being consulted. Permission
//! kinds are validated before any lookup, so a misconfigured guard is reported as
//! `INVALID_PERMISSION_TYPE` instead of silently denying.

use crate::error::ErrorBody;
use crate::middleware::principal::Principal;
use crate::permissions::{PermissionEngine, PermissionStore, PermissionType, SqlPermissionStore};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// One permission a request needs. `kind` is parsed when the guard runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionTarget {
    pub kind: String,
    pub database: String,
    pub table: Option<String>,
}

impl PermissionTarget {
    pub fn new(kind: impl Into<String>, database: impl Into<String>, table: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            database: database.into(),
            table: table.map(String::from),
        }
    }

    pub fn database(kind: impl Into<String>, database: impl Into<String>) -> Self {
        Self::new(kind, database, None)
    }

    pub fn table(
        kind: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            database: database.into(),
            table: Some(table.into()),
        }
    }

    fn resource(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", self.database, table),
            None => self.database.clone(),
        }
    }
}

impl std::fmt::Display for PermissionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.kind.to_ascii_uppercase(), self.resource())
    }
}

/// Derives the required permission from the request; `None` means it cannot.
pub type TargetResolver = Arc<dyn Fn(&Request<Body>) -> Option<PermissionTarget> + Send + Sync>;

#[derive(Clone)]
enum Requirement {
    All(Vec<PermissionTarget>),
    Any(Vec<PermissionTarget>),
    Dynamic(TargetResolver),
}

impl std::fmt::Debug for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requirement::All(targets) => f.debug_tuple("All").field(targets).finish(),
            Requirement::Any(targets) => f.debug_tuple("Any").field(targets).finish(),
            Requirement::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Why a request was not authorized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzRejection {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Administrator privileges required")]
    AdminRequired,

    #[error("Insufficient permissions: {detail}")]
    InsufficientPermissions { detail: String },

    #[error("{message}")]
    InvalidPermissionType { message: String },

    #[error("Could not determine the permission required for this request")]
    ResolutionFailed,
}

impl AuthzRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::AdminRequired => "ADMIN_REQUIRED",
            Self::InsufficientPermissions { .. } => "INSUFFICIENT_PERMISSIONS",
            Self::InvalidPermissionType { .. } => "INVALID_PERMISSION_TYPE",
            Self::ResolutionFailed => "PERMISSION_RESOLUTION_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::AdminRequired | Self::InsufficientPermissions { .. } => StatusCode::FORBIDDEN,
            Self::InvalidPermissionType { .. } | Self::ResolutionFailed => StatusCode::BAD_REQUEST,
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Self::AuthenticationRequired => Some("Authenticate before calling this endpoint".into()),
            Self::AdminRequired => Some("This endpoint is restricted to administrators".into()),
            Self::InsufficientPermissions { .. } => {
                Some("Ask an administrator to grant the missing permission".into())
            }
            Self::InvalidPermissionType { .. } => {
                Some("Use one of READ, WRITE, DELETE, CREATE".into())
            }
            Self::ResolutionFailed => {
                Some("Check that the request names a database (and table, if required)".into())
            }
        }
    }
}

impl IntoResponse for AuthzRejection {
    fn into_response(self) -> Response {
        let body = ErrorBody::new(self.code(), self.to_string(), self.suggestion());
        (self.status_code(), Json(body)).into_response()
    }
}

/// Route-level authorization requirement bound to a permission engine.
pub struct PermissionGuard<S = SqlPermissionStore> {
    engine: Arc<PermissionEngine<S>>,
    requirement: Requirement,
}

impl<S> Clone for PermissionGuard<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            requirement: self.requirement.clone(),
        }
    }
}

impl<S> std::fmt::Debug for PermissionGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGuard")
            .field("requirement", &self.requirement)
            .finish()
    }
}

/// Principal, mode and parsed targets of a non-admin check.
type PreparedCheck = (Principal, Mode, Vec<(PermissionType, PermissionTarget)>);

/// Whether every or at least one target must be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Any,
}

impl<S: PermissionStore> PermissionGuard<S> {
    /// Require one permission on a database, or on a table when `table` is given.
    pub fn require_permission(
        engine: Arc<PermissionEngine<S>>,
        kind: impl Into<String>,
        database: impl Into<String>,
        table: Option<&str>,
    ) -> Self {
        Self::require_all(engine, vec![PermissionTarget::new(kind, database, table)])
    }

    /// Require every listed permission. An empty list denies.
    pub fn require_all(engine: Arc<PermissionEngine<S>>, targets: Vec<PermissionTarget>) -> Self {
        Self {
            engine,
            requirement: Requirement::All(targets),
        }
    }

    /// Require at least one listed permission. An empty list denies.
    pub fn require_any(engine: Arc<PermissionEngine<S>>, targets: Vec<PermissionTarget>) -> Self {
        Self {
            engine,
            requirement: Requirement::Any(targets),
        }
    }

    /// Require the permission `resolver` derives from each request.
    pub fn require_dynamic<F>(engine: Arc<PermissionEngine<S>>, resolver: F) -> Self
    where
        F: Fn(&Request<Body>) -> Option<PermissionTarget> + Send + Sync + 'static,
    {
        Self {
            engine,
            requirement: Requirement::Dynamic(Arc::new(resolver)),
        }
    }

    /// Decide whether `principal` may make `request`.
    ///
    /// Everything that needs the request happens before the returned future is
    /// created, so the future does not borrow the (non-`Sync`) body.
    pub fn authorize<'a>(
        &'a self,
        principal: Option<Principal>,
        request: &Request<Body>,
    ) -> impl Future<Output = Result<(), AuthzRejection>> + Send + use<'a, S> {
        let prepared = self.prepare(principal, request);
        async move {
            let Some((principal, mode, checks)) = prepared? else {
                return Ok(());
            };
            self.evaluate(principal, mode, checks).await
        }
    }

    /// Synchronous half of [`authorize`](Self::authorize). `Ok(None)` means admin bypass.
    fn prepare(
        &self,
        principal: Option<Principal>,
        request: &Request<Body>,
    ) -> Result<Option<PreparedCheck>, AuthzRejection> {
        let Some(principal) = principal else {
            return Err(AuthzRejection::AuthenticationRequired);
        };
        if principal.is_admin {
            debug!(user_id = principal.user_id, "Admin bypass");
            return Ok(None);
        }

        let (mode, targets) = match &self.requirement {
            Requirement::All(targets) => (Mode::All, targets.clone()),
            Requirement::Any(targets) => (Mode::Any, targets.clone()),
            Requirement::Dynamic(resolver) => match resolver(request) {
                Some(target) => (Mode::All, vec![target]),
                None => {
                    warn!(
                        user_id = principal.user_id,
                        path = %request.uri().path(),
                        "Could not resolve required permission"
                    );
                    return Err(AuthzRejection::ResolutionFailed);
                }
            },
        };

        let checks = targets
            .into_iter()
            .map(|target| {
                target
                    .kind
                    .parse::<PermissionType>()
                    .map(|kind| (kind, target))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AuthzRejection::InvalidPermissionType {
                message: e.to_string(),
            })?;

        Ok(Some((principal, mode, checks)))
    }

    async fn evaluate(
        &self,
        principal: Principal,
        mode: Mode,
        checks: Vec<(PermissionType, PermissionTarget)>,
    ) -> Result<(), AuthzRejection> {
        if checks.is_empty() {
            return Err(AuthzRejection::InsufficientPermissions {
                detail: "no permission satisfies this route".to_string(),
            });
        }

        for (kind, target) in &checks {
            let granted = self
                .engine
                .has_permission(
                    principal.user_id,
                    &target.database,
                    target.table.as_deref(),
                    *kind,
                )
                .await;

            match (mode, granted) {
                (Mode::Any, true) => return Ok(()),
                (Mode::All, false) => {
                    warn!(user_id = principal.user_id, required = %target, "Permission denied");
                    return Err(AuthzRejection::InsufficientPermissions {
                        detail: format!("{} required", target),
                    });
                }
                _ => {}
            }
        }

        match mode {
            Mode::All => Ok(()),
            Mode::Any => {
                let listed: Vec<String> = checks.iter().map(|(_, t)| t.to_string()).collect();
                warn!(user_id = principal.user_id, required = ?listed, "Permission denied");
                Err(AuthzRejection::InsufficientPermissions {
                    detail: format!("one of [{}] required", listed.join(", ")),
                })
            }
        }
    }
}

/// Middleware running a [`PermissionGuard`] before the handler.
pub async fn enforce<S: PermissionStore + 'static>(
    State(guard): State<PermissionGuard<S>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let principal = request.extensions().get::<Principal>().copied();
    match guard.authorize(principal, &request).await {
        Ok(()) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}

/// Middleware restricting a route to admin principals.
pub async fn require_admin(request: Request<Body>, next: Next) -> Response {
    match request.extensions().get::<Principal>().copied() {
        Some(principal) if principal.is_admin => next.run(request).await,
        Some(principal) => {
            warn!(
                user_id = principal.user_id,
                path = %request.uri().path(),
                "Admin route denied"
            );
            AuthzRejection::AdminRequired.into_response()
        }
        None => AuthzRejection::AuthenticationRequired.into_response(),
    }
}
