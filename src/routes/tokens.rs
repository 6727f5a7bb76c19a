//! Credential issuance endpoints: CSRF tokens and API keys.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::KeyOptions;
use crate::error::{SecurityError, SecurityResult};
use crate::service::SecurityService;

const MAX_KEY_LIFETIME_DAYS: u32 = 3650;
const MAX_SCOPES: usize = 32;

/// Issues a CSRF token, bound to the session header when the client sends one.
///
/// The token is returned in the body (to be echoed in the CSRF header) and set
/// as a cookie.
pub async fn csrf_token(State(security): State<Arc<SecurityService>>, headers: HeaderMap) -> impl IntoResponse {
    let csrf = security.csrf();
    let session = csrf.extract_session(&headers);
    let token = security.generate_csrf_token(session);
    let cookie = csrf.cookie_header(&token);
    (
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "token": token,
            "header_name": csrf.header_name(),
            "session_bound": session.is_some(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in_days: Option<u32>,
    pub metadata: Option<Value>,
}

/// Issues a new API key. The plaintext key appears in this response only.
pub async fn create_key(
    State(security): State<Arc<SecurityService>>,
    Json(req): Json<CreateKeyRequest>,
) -> SecurityResult<impl IntoResponse> {
    if req.scopes.len() > MAX_SCOPES {
        return Err(SecurityError::Validation {
            field: "scopes".to_string(),
            message: format!("at most {} scopes are allowed", MAX_SCOPES),
        });
    }
    if let Some(bad) = req.scopes.iter().find(|s| !is_valid_scope(s)) {
        return Err(SecurityError::Validation {
            field: "scopes".to_string(),
            message: format!("invalid scope '{}'", crate::sanitizer::sanitize_for_logging(bad)),
        });
    }
    if let Some(days) = req.expires_in_days {
        if days == 0 || days > MAX_KEY_LIFETIME_DAYS {
            return Err(SecurityError::Validation {
                field: "expires_in_days".to_string(),
                message: format!("must be between 1 and {}", MAX_KEY_LIFETIME_DAYS),
            });
        }
    }

    let generated = security.generate_api_key(KeyOptions {
        scopes: req.scopes,
        expires_in_days: req.expires_in_days,
        metadata: req.metadata,
    });
    Ok((StatusCode::CREATED, Json(generated)))
}

fn is_valid_scope(scope: &str) -> bool {
    scope == "*"
        || (!scope.is_empty()
            && scope.len() <= 64
            && scope.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, ':' | '_' | '-')))
}
