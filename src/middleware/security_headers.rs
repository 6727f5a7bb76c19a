//! Security headers middleware for HTTP responses.
//!
//! Adds the hardening headers and a per-response Content-Security-Policy to
//! every response. The script nonce issued for the response is made available
//! to handlers through the [`CspNonce`] request extension.

use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::service::SecurityService;

/// The CSP script nonce for the current response.
#[derive(Debug, Clone)]
pub struct CspNonce(pub String);

/// Adds security-related HTTP headers to all responses.
///
/// # Caching Policies
///
/// - API responses (JSON): `no-store` plus `Pragma: no-cache`
/// - Everything else is left to the handler
pub async fn security_headers_middleware(
    State(security): State<Arc<SecurityService>>,
    mut req: Request,
    next: Next,
) -> Response {
    let rendered = security.response_headers();
    req.extensions_mut().insert(CspNonce(rendered.nonce));

    let mut res = next.run(req).await;
    let headers = res.headers_mut();

    for (name, value) in &rendered.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping security header with invalid name or value"),
        }
    }

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    res
}
