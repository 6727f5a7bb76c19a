use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::auth::BearerTokenValidator;
use crate::error::SecurityError;
use crate::service::SecurityService;

/// Middleware that requires a valid API key.
///
/// The key is read from the configured API-key header (default `X-API-Key`)
/// or, failing that, from `Authorization: Bearer <key>`. On success the
/// matching [`ApiKey`](crate::auth::ApiKey) record is inserted into the request
/// extensions for handlers to inspect scopes.
pub async fn api_key_middleware(
    State(security): State<Arc<SecurityService>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_name = security.config().api_keys.header_name.as_str();
    let provided = req
        .headers()
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(BearerTokenValidator::extract_token)
        })
        .map(str::to_string);

    let Some(key) = provided else {
        security.metrics().inc_auth_failures();
        return SecurityError::Unauthorized("API key required".to_string()).into_response();
    };

    let result = security.validate_api_key(&key);
    match (result.valid, result.key) {
        (true, Some(record)) => {
            tracing::debug!(key_id = %record.id, path = %req.uri().path(), "API key accepted");
            req.extensions_mut().insert(record);
            next.run(req).await
        }
        (_, record) => {
            let reason = result.reason.unwrap_or("Invalid API key");
            tracing::warn!(
                key_id = record.as_ref().map(|r| r.id.as_str()).unwrap_or("-"),
                reason,
                "API key rejected"
            );
            SecurityError::Unauthorized(reason.to_string()).into_response()
        }
    }
}
