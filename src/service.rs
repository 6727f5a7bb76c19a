//! The `SecurityService` façade.
//!
//! One instance is constructed at startup from a [`SecurityConfig`] and shared
//! (behind an `Arc`) with every middleware and handler that needs it. There is
//! no global instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value;

use crate::auth::{ApiKeyManager, BearerTokenValidator, GeneratedKey, KeyOptions, KeyValidation, RequestSigner, Verification};
use crate::backoff::ExponentialBackoff;
use crate::config::SecurityConfig;
use crate::csrf::{CsrfProtection, DoubleSubmitCookie, OriginCheck, OriginValidator};
use crate::error::SecurityResult;
use crate::headers::{CspBuilder, NonceTarget, SecurityHeadersBuilder};
use crate::metrics::Metrics;
use crate::rate_limit::{RateLimitInfo, RateLimiter};
use crate::sanitizer::{InputSanitizer, SanitizeResult};
use crate::validator::{ValidationResult, ValidationSchema, Validator};

/// Headers to attach to one response, plus the CSP nonce issued for it.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    pub headers: BTreeMap<String, String>,
    pub nonce: String,
}

/// Owns one instance of every security component.
pub struct SecurityService {
    config: Arc<SecurityConfig>,
    sanitizer: InputSanitizer,
    validator: Validator,
    rate_limiter: RateLimiter,
    backoff: ExponentialBackoff,
    csrf: CsrfProtection,
    origin: OriginValidator,
    double_submit: DoubleSubmitCookie,
    csp: CspBuilder,
    headers: SecurityHeadersBuilder,
    api_keys: ApiKeyManager,
    bearer: BearerTokenValidator,
    signer: RequestSigner,
    metrics: Metrics,
}

impl SecurityService {
    /// Wires every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Config`](crate::error::SecurityError::Config) when the
    /// CSRF or signing secret is missing or shorter than 32 bytes.
    pub fn new(config: SecurityConfig) -> SecurityResult<Self> {
        let csrf = CsrfProtection::new(&config.csrf)?;
        let signer = RequestSigner::new(&config.signing)?;
        let api_keys = ApiKeyManager::new(&config.api_keys);
        // Shares the key store, so keys issued later are accepted too
        let bearer = BearerTokenValidator::new(Arc::new(api_keys.clone()));

        let service = Self {
            sanitizer: InputSanitizer::new(config.sanitizer.clone()),
            validator: Validator::new(),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            backoff: ExponentialBackoff::new(config.backoff.clone()),
            csrf,
            origin: OriginValidator::new(&config.cors),
            double_submit: DoubleSubmitCookie::new(&config.csrf),
            csp: CspBuilder::from_config(&config.csp),
            headers: SecurityHeadersBuilder::new(config.headers.clone()),
            api_keys,
            bearer,
            signer,
            metrics: Metrics::new(),
            config: Arc::new(config),
        };
        tracing::info!(
            rate_limit_enabled = service.config.rate_limit.enabled,
            window_ms = service.config.rate_limit.window_ms,
            max_requests = service.config.rate_limit.max_requests,
            "Security service initialized"
        );
        Ok(service)
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn sanitizer(&self) -> &InputSanitizer {
        &self.sanitizer
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    pub fn csrf(&self) -> &CsrfProtection {
        &self.csrf
    }

    pub fn origin_validator(&self) -> &OriginValidator {
        &self.origin
    }

    pub fn double_submit(&self) -> &DoubleSubmitCookie {
        &self.double_submit
    }

    pub fn api_keys(&self) -> &ApiKeyManager {
        &self.api_keys
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Rate limiting

    pub fn check_rate_limit(&self, id: &str) -> RateLimitInfo {
        let info = self.rate_limiter.check(id);
        if info.allowed {
            self.metrics.inc_allowed();
        } else {
            self.metrics.inc_limited();
            tracing::warn!(identifier = id, "Request rejected by rate limiter");
        }
        info
    }

    pub fn record_request(&self, id: &str, success: bool) -> RateLimitInfo {
        self.rate_limiter.increment(id, success)
    }

    // CSRF

    pub fn generate_csrf_token(&self, session_id: Option<&str>) -> String {
        self.csrf.generate_token(session_id)
    }

    pub fn validate_csrf_token(&self, token: &str, session_id: Option<&str>) -> bool {
        let valid = self.csrf.validate_token(token, session_id);
        if !valid {
            self.metrics.inc_csrf_failures();
        }
        valid
    }

    pub fn validate_origin(&self, headers: &HeaderMap) -> OriginCheck {
        let check = self.origin.validate_request(headers);
        if !check.valid {
            self.metrics.inc_csrf_failures();
        }
        check
    }

    // Sanitization and validation

    pub fn sanitize_html(&self, input: &str) -> SanitizeResult {
        let result = self.sanitizer.sanitize_html(input);
        self.metrics.add_sanitized(result.removed.len() as u64);
        result
    }

    pub fn sanitize_prompt(&self, input: &str) -> SanitizeResult {
        let result = self.sanitizer.sanitize_prompt(input);
        self.metrics.add_sanitized(result.removed.len() as u64);
        result
    }

    pub fn validate(&self, data: &Value, schema: &ValidationSchema) -> ValidationResult {
        let result = self.validator.validate(data, schema);
        if !result.valid {
            self.metrics.inc_validation_failures();
        }
        result
    }

    // Response headers

    /// Builds the full header set for one response from a fresh copy of the
    /// CSP template, so every response gets its own nonce.
    pub fn response_headers(&self) -> ResponseHeaders {
        let mut csp = self.csp.clone();
        let nonce = csp.generate_nonce(NonceTarget::Script);
        let mut headers = self.headers.build();
        headers.insert(csp.header_name().to_string(), csp.build());
        ResponseHeaders { headers, nonce }
    }

    // Credentials

    pub fn generate_api_key(&self, options: KeyOptions) -> GeneratedKey {
        self.metrics.inc_keys_issued();
        self.api_keys.generate_key(options)
    }

    pub fn validate_api_key(&self, key: &str) -> KeyValidation {
        let result = self.api_keys.validate_key(key);
        if !result.valid {
            self.metrics.inc_auth_failures();
        }
        result
    }

    pub fn sign_request(&self, payload: &Value) -> String {
        self.signer.sign(payload)
    }

    pub fn verify_request(&self, payload: &Value, signature: &str) -> Verification {
        let result = self.signer.verify(payload, signature);
        if !result.valid {
            self.metrics.inc_signature_failures();
            tracing::warn!(reason = ?result.reason, "Signed request rejected");
        }
        result
    }

    /// The bearer validator that accepts this service's API keys.
    pub fn bearer_validator(&self) -> &BearerTokenValidator {
        &self.bearer
    }

    /// Stops the rate limiter sweep and drops in-memory state.
    pub fn shutdown(&self) {
        self.rate_limiter.destroy();
        self.api_keys.clear();
        tracing::info!("Security service shut down");
    }
}
