use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::validator::FieldError;

/// The error type for the security toolkit.
///
/// Validation, sanitization and verification never produce this type; they
/// return structured results. `SecurityError` is what the HTTP adapters hand
/// back to clients and what construction returns on bad configuration.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// Invalid or missing configuration. Raised once, at startup.
    #[error("Configuration error: {0}")]
    Config(String),
    /// The client exceeded its request budget or is blocked.
    #[error("Rate limited. Retry after {retry_after_seconds} seconds")]
    RateLimited {
        /// Seconds until the client may retry.
        retry_after_seconds: u64,
    },
    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// Credentials were fine but the request is not permitted (CSRF, origin, scope).
    #[error("Forbidden: {0}")]
    Forbidden(String),
    /// A single field failed validation.
    #[error("Validation error on field '{field}': {message}")]
    Validation {
        /// The name of the field that failed validation.
        field: String,
        /// A message describing the validation error.
        message: String,
    },
    /// A payload failed schema validation.
    #[error("Validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<FieldError>),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, error_code, error_message, details) = match self {
            SecurityError::Config(msg) => {
                tracing::error!("Configuration error surfaced to a request: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "The server is misconfigured".to_string(),
                    None,
                )
            }
            SecurityError::RateLimited { retry_after_seconds } => {
                retry_after = Some(retry_after_seconds);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    format!("Too many requests. Please retry after {} seconds", retry_after_seconds),
                    Some(json!({ "retry_after_seconds": retry_after_seconds })),
                )
            }
            SecurityError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg, None),
            SecurityError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg, None),
            SecurityError::Validation { field, message } => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("Validation failed for field '{}'", field),
                Some(json!({ "field": field, "message": message })),
            ),
            SecurityError::ValidationFailed(errors) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("Validation failed with {} error(s)", errors.len()),
                Some(json!({ "errors": errors })),
            ),
            SecurityError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            SecurityError::Internal(e) => {
                let error_id = uuid::Uuid::new_v4();
                tracing::error!(%error_id, "Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                    Some(json!({ "error_id": error_id.to_string() })),
                )
            }
        };

        let mut body = json!({
            "error": {
                "code": error_code,
                "message": error_message,
            },
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(details) = details {
            body["error"]["details"] = details;
        }

        let mut res = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            res.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        res
    }
}

/// A type alias for `Result<T, SecurityError>`.
pub type SecurityResult<T> = Result<T, SecurityError>;
