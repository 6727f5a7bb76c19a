//! Cross-Site Request Forgery (CSRF) protection middleware.
//!
//! State-changing requests must pass the origin check and carry a valid signed
//! token in the configured CSRF header. When the client sends the session
//! header, the token must have been issued for that session.

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::SecurityError;
use crate::service::SecurityService;

/// CSRF protection middleware for state-changing operations.
///
/// Safe methods (GET, HEAD, OPTIONS, TRACE) pass through untouched.
///
/// # Returns
///
/// The downstream response, or a 403 JSON error when the origin check or the
/// token check fails.
pub async fn csrf_protection_middleware(
    State(security): State<Arc<SecurityService>>,
    req: Request,
    next: Next,
) -> Response {
    if !is_state_changing(req.method()) {
        return next.run(req).await;
    }

    let headers = req.headers();
    let origin = security.validate_origin(headers);
    if !origin.valid {
        let reason = origin.reason.unwrap_or_else(|| "Origin check failed".to_string());
        tracing::warn!(method = %req.method(), path = %req.uri().path(), %reason, "CSRF origin check failed");
        return SecurityError::Forbidden(reason).into_response();
    }

    let csrf = security.csrf();
    let Some(token) = csrf.extract_token(headers) else {
        security.metrics().inc_csrf_failures();
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "Missing CSRF token");
        return SecurityError::Forbidden(format!("CSRF token required in '{}' header", csrf.header_name()))
            .into_response();
    };
    let session = csrf.extract_session(headers);
    if !security.validate_csrf_token(token, session) {
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "Invalid CSRF token");
        return SecurityError::Forbidden("Invalid CSRF token".to_string()).into_response();
    }

    next.run(req).await
}

fn is_state_changing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE | Method::PATCH)
}
