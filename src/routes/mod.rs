//! HTTP route handlers for the demo server.
//!
//! - `health`: health, version and metrics endpoints
//! - `tokens`: CSRF token and API key issuance
//! - `api`: API-key protected echo and signed webhook

pub mod api;
pub mod health;
pub mod tokens;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::middleware;
use crate::service::SecurityService;

/// Request bodies above this size are rejected before reaching a handler.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the full application router.
///
/// Layer order, outermost first: security headers, tracing, rate limiting,
/// body limit. CSRF and API-key checks are applied per route group.
pub fn build_router(security: Arc<SecurityService>) -> Router {
    let key_protected = Router::new()
        .route("/api/echo", post(api::echo))
        .route_layer(from_fn_with_state(security.clone(), middleware::auth::api_key_middleware));

    let csrf_protected = Router::new()
        .route("/keys", post(tokens::create_key))
        .route_layer(from_fn_with_state(security.clone(), middleware::csrf::csrf_protection_middleware));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/version", get(health::version))
        .route("/metrics", get(health::metrics))
        .route("/metrics/prometheus", get(health::metrics_prometheus))
        .route("/csrf-token", get(tokens::csrf_token))
        .route("/webhook", post(api::webhook))
        .merge(key_protected)
        .merge(csrf_protected)
        .with_state(security.clone())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(from_fn_with_state(security.clone(), middleware::rate_limit::rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(security, middleware::security_headers::security_headers_middleware))
}
