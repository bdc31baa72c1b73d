//! Request principal.
//!
//! Upstream authentication places a [`Principal`] in the request extensions. For
//! deployments behind an authenticating proxy, [`trusted_principal`] builds it from
//! the `X-User-Id` / `X-User-Admin` headers instead.

use crate::error::ErrorBody;
use crate::middleware::authorize::AuthzRejection;
use axum::{
    Json,
    body::Body,
    extract::FromRequestParts,
    http::{HeaderMap, Request, StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ADMIN_HEADER: &str = "x-user-admin";

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Principal {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = AuthzRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .copied()
            .ok_or(AuthzRejection::AuthenticationRequired)
    }
}

/// Read the principal headers. `Ok(None)` when no user id header is present.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<Option<Principal>, String> {
    let Some(raw_id) = headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    let user_id = raw_id
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(|| format!("{} must be an integer user id", USER_ID_HEADER))?;

    let is_admin = match headers.get(USER_ADMIN_HEADER) {
        None => false,
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| format!("{} contains invalid characters", USER_ADMIN_HEADER))?;
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            )
        }
    };

    Ok(Some(Principal { user_id, is_admin }))
}

/// Middleware inserting a [`Principal`] built from trusted proxy headers.
///
/// Only install this when a fronting proxy strips these headers from client requests.
pub async fn trusted_principal(mut request: Request<Body>, next: Next) -> Response {
    match principal_from_headers(request.headers()) {
        Ok(Some(principal)) => {
            debug!(
                user_id = principal.user_id,
                is_admin = principal.is_admin,
                "Principal from trusted headers"
            );
            request.extensions_mut().insert(principal);
        }
        Ok(None) => {}
        Err(message) => {
            warn!(error = %message, "Rejecting malformed principal headers");
            let body = ErrorBody::new(
                "INVALID_PRINCIPAL",
                message,
                Some(format!("Send {} as an integer", USER_ID_HEADER)),
            );
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_no_headers_no_principal() {
        assert_eq!(principal_from_headers(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_user_and_admin_headers() {
        let principal = principal_from_headers(&headers(&[(USER_ID_HEADER, "42")]))
            .unwrap()
            .unwrap();
        assert_eq!(principal, Principal::user(42));

        let principal =
            principal_from_headers(&headers(&[(USER_ID_HEADER, "1"), (USER_ADMIN_HEADER, "TRUE")]))
                .unwrap()
                .unwrap();
        assert!(principal.is_admin);

        let principal =
            principal_from_headers(&headers(&[(USER_ID_HEADER, "1"), (USER_ADMIN_HEADER, "no")]))
                .unwrap()
                .unwrap();
        assert!(!principal.is_admin);
    }

    #[test]
    fn test_malformed_user_id() {
        assert!(principal_from_headers(&headers(&[(USER_ID_HEADER, "seven")])).is_err());
    }
}
