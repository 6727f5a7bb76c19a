use crate::service::SecurityService;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

// Health check endpoint - lightweight, no dependencies
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// Metrics endpoint: counters plus current store sizes
pub async fn metrics(State(security): State<Arc<SecurityService>>) -> impl IntoResponse {
    let snapshot = security.metrics().get_snapshot();
    Json(serde_json::json!({
        "counters": snapshot,
        "tracked_clients": security.rate_limiter().len(),
        "api_keys": security.api_keys().len(),
    }))
}

// Prometheus-compatible text exposition format
pub async fn metrics_prometheus(State(security): State<Arc<SecurityService>>) -> impl IntoResponse {
    let m = security.metrics().get_snapshot();
    let counters = [
        ("requests_allowed", "Requests admitted by the rate limiter", m.requests_allowed),
        ("requests_limited", "Requests rejected by the rate limiter", m.requests_limited),
        ("csrf_failures", "Failed CSRF or origin checks", m.csrf_failures),
        ("auth_failures", "Rejected API keys", m.auth_failures),
        ("signature_failures", "Rejected signed requests", m.signature_failures),
        ("validation_failures", "Payloads that failed validation", m.validation_failures),
        ("sanitized_fragments", "Fragments removed by the sanitizer", m.sanitized_fragments),
        ("keys_issued", "API keys issued", m.keys_issued),
    ];
    let mut body = String::new();
    for (name, help, value) in counters {
        body.push_str(&format!(
            "# HELP miyabi_security_{name} {help}\n# TYPE miyabi_security_{name} counter\nmiyabi_security_{name} {value}\n"
        ));
    }
    body.push_str(&format!(
        "# HELP miyabi_security_uptime_seconds Uptime seconds\n# TYPE miyabi_security_uptime_seconds gauge\nmiyabi_security_uptime_seconds {}\n",
        m.uptime_seconds
    ));
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

// Version/Build info endpoint (JSON)
pub async fn version() -> impl IntoResponse {
    let body = serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "package": {
            "description": env!("CARGO_PKG_DESCRIPTION"),
            "authors": env!("CARGO_PKG_AUTHORS"),
            "license": env!("CARGO_PKG_LICENSE"),
        },
        "build": {
            "profile": if cfg!(debug_assertions) { "debug" } else { "release" },
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        }
    });
    (StatusCode::OK, Json(body))
}
