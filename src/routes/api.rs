//! Protected endpoints: an API-key guarded echo and a signed webhook receiver.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Extension, Json,
};
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::ApiKey;
use crate::error::{SecurityError, SecurityResult};
use crate::middleware::CspNonce;
use crate::service::SecurityService;
use crate::validator::{ValidationRule, ValidationSchema};

pub const ECHO_SCOPE: &str = "echo";

lazy_static! {
    static ref ECHO_SCHEMA: ValidationSchema = ValidationSchema::new()
        .field("name", ValidationRule::string().required().min_length(1).max_length(100))
        .field("email", ValidationRule::email())
        .field("message", ValidationRule::string().required().max_length(5000));
}

/// Validates the payload, sanitizes it and returns what survived.
///
/// Requires an API key with the `echo` scope (or `*`).
pub async fn echo(
    State(security): State<Arc<SecurityService>>,
    Extension(key): Extension<ApiKey>,
    nonce: Option<Extension<CspNonce>>,
    Json(body): Json<Value>,
) -> SecurityResult<impl IntoResponse> {
    if !key.has_scope(ECHO_SCOPE) {
        return Err(SecurityError::Forbidden(format!("API key lacks the '{}' scope", ECHO_SCOPE)));
    }

    let result = security.validate(&body, &ECHO_SCHEMA);
    if !result.valid {
        return Err(SecurityError::ValidationFailed(result.errors));
    }

    let sanitizer = security.sanitizer();
    let name = sanitizer.sanitize_text(body["name"].as_str().unwrap_or_default());
    let message = security.sanitize_html(body["message"].as_str().unwrap_or_default());

    Ok(Json(json!({
        "key_id": key.id,
        "name": name,
        "email": body.get("email").cloned().unwrap_or(Value::Null),
        "message": message.sanitized,
        "removed": message.removed,
        "warnings": message.warnings,
        "csp_nonce": nonce.map(|Extension(CspNonce(n))| n),
    })))
}

/// Accepts a JSON payload only if the signature header verifies.
pub async fn webhook(
    State(security): State<Arc<SecurityService>>,
    headers: HeaderMap,
    body: Bytes,
) -> SecurityResult<impl IntoResponse> {
    let header_name = security.config().signing.header_name.as_str();
    let signature = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SecurityError::Unauthorized(format!("Missing '{}' header", header_name)))?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| SecurityError::BadRequest(format!("Invalid JSON payload: {}", e)))?;

    let verification = security.verify_request(&payload, signature);
    if !verification.valid {
        return Err(SecurityError::Unauthorized(
            verification.reason.unwrap_or_else(|| "Invalid signature".to_string()),
        ));
    }

    tracing::info!(bytes = body.len(), "Accepted signed webhook");
    Ok(Json(json!({ "received": true })))
}
