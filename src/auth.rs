//! Credential handling: API key lifecycle, HMAC request signing and bearer
//! token extraction.
//!
//! API keys are never stored in plaintext. The manager keeps a SHA-256 hash per
//! key and compares hashes in constant time against every stored record.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ApiKeyConfig, SigningConfig};
use crate::crypto::{constant_time_eq, hmac_sha256_hex, random_hex, sha256_hex};
use crate::csrf::require_secret;
use crate::error::SecurityResult;

const KEY_TAG_BYTES: usize = 4;
const KEY_BODY_BYTES: usize = 32;

/// Longer `expires_in_days` values are clamped to this.
pub const MAX_KEY_LIFETIME_DAYS: u32 = 36_500;

/// Outcome of a credential check. `reason` is set whenever `valid` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verification {
    pub fn ok() -> Self {
        Self { valid: true, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

/// A stored API key record. The hash is never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// The 8-hex tag embedded in the plaintext key, safe to display.
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ApiKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// A `*` scope grants everything.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains("*") || self.scopes.contains(scope)
    }
}

/// Options for [`ApiKeyManager::generate_key`].
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub scopes: Vec<String>,
    pub expires_in_days: Option<u32>,
    pub metadata: Option<Value>,
}

/// A freshly issued key. `key` is the only copy of the plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedKey {
    pub key: String,
    pub record: ApiKey,
}

/// Result of [`ApiKeyManager::validate_key`].
///
/// An expired key is invalid but its record is still returned for diagnostics.
#[derive(Debug, Clone)]
pub struct KeyValidation {
    pub valid: bool,
    pub key: Option<ApiKey>,
    pub reason: Option<&'static str>,
}

impl KeyValidation {
    fn fail(reason: &'static str, key: Option<ApiKey>) -> Self {
        Self { valid: false, key, reason: Some(reason) }
    }
}

/// In-memory API key store.
#[derive(Clone)]
pub struct ApiKeyManager {
    prefix: String,
    keys: Arc<DashMap<String, ApiKey>>,
}

impl ApiKeyManager {
    pub fn new(config: &ApiKeyConfig) -> Self {
        Self { prefix: config.prefix.clone(), keys: Arc::new(DashMap::new()) }
    }

    /// Issues a key of the form `<prefix>_<8 hex>_<64 hex>` and stores only its hash.
    pub fn generate_key(&self, options: KeyOptions) -> GeneratedKey {
        let created_at = Utc::now();
        let expires_at = options.expires_in_days.map(|days| {
            if days > MAX_KEY_LIFETIME_DAYS {
                tracing::warn!(days, max = MAX_KEY_LIFETIME_DAYS, "Clamped API key lifetime");
            }
            expiry_after(created_at, ChronoDuration::days(days.min(MAX_KEY_LIFETIME_DAYS).into()))
        });
        self.issue(options.scopes.into_iter().collect(), expires_at, options.metadata, created_at)
    }

    /// Checks format, then looks the key up by hash. Updates `last_used_at` on success.
    pub fn validate_key(&self, key: &str) -> KeyValidation {
        if !self.is_well_formed(key) {
            return KeyValidation::fail("Invalid key format", None);
        }

        let candidate = sha256_hex(key.as_bytes());
        let mut matched: Option<String> = None;
        // Compare against every record so timing does not reveal which key was close
        for entry in self.keys.iter() {
            if constant_time_eq(entry.key_hash.as_bytes(), candidate.as_bytes()) && matched.is_none() {
                matched = Some(entry.key().clone());
            }
        }

        let Some(id) = matched else {
            return KeyValidation::fail("Key not found", None);
        };
        let Some(mut record) = self.keys.get_mut(&id) else {
            // Revoked between the scan and the lookup
            return KeyValidation::fail("Key not found", None);
        };

        let now = Utc::now();
        if record.is_expired_at(now) {
            tracing::warn!(key_id = %record.id, prefix = %record.prefix, "Rejected expired API key");
            return KeyValidation::fail("Key expired", Some(record.clone()));
        }
        record.last_used_at = Some(now);
        KeyValidation { valid: true, key: Some(record.clone()), reason: None }
    }

    /// Scope check by key id. Unknown ids have no scopes.
    pub fn has_scope(&self, id: &str, scope: &str) -> bool {
        self.keys.get(id).is_some_and(|k| k.has_scope(scope))
    }

    pub fn revoke_key(&self, id: &str) -> bool {
        let removed = self.keys.remove(id).is_some();
        if removed {
            tracing::info!(key_id = id, "API key revoked");
        }
        removed
    }

    /// Replaces the key with a new one carrying the same scopes, metadata and
    /// validity period. The old plaintext stops validating immediately.
    pub fn rotate_key(&self, id: &str) -> Option<GeneratedKey> {
        let (_, old) = self.keys.remove(id)?;
        let created_at = Utc::now();
        let expires_at = old.expires_at.map(|exp| expiry_after(created_at, exp - old.created_at));
        let generated = self.issue(old.scopes, expires_at, old.metadata, created_at);
        tracing::info!(old_key_id = id, new_key_id = %generated.record.id, "API key rotated");
        Some(generated)
    }

    pub fn get_key(&self, id: &str) -> Option<ApiKey> {
        self.keys.get(id).map(|k| k.clone())
    }

    /// All records, oldest first.
    pub fn list_keys(&self) -> Vec<ApiKey> {
        let mut keys: Vec<ApiKey> = self.keys.iter().map(|k| k.clone()).collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        keys
    }

    /// Drops expired records and returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.keys.len();
        self.keys.retain(|_, k| !k.is_expired_at(now));
        let removed = before.saturating_sub(self.keys.len());
        if removed > 0 {
            tracing::info!(removed, "Removed expired API keys");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&self) {
        self.keys.clear();
    }

    fn issue(
        &self,
        scopes: BTreeSet<String>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<Value>,
        created_at: DateTime<Utc>,
    ) -> GeneratedKey {
        let tag = random_hex(KEY_TAG_BYTES);
        let key = format!("{}_{}_{}", self.prefix, tag, random_hex(KEY_BODY_BYTES));
        let record = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            key_hash: sha256_hex(key.as_bytes()),
            prefix: tag,
            created_at,
            expires_at,
            last_used_at: None,
            scopes,
            metadata,
        };
        self.keys.insert(record.id.clone(), record.clone());
        tracing::info!(key_id = %record.id, prefix = %record.prefix, scopes = ?record.scopes, "API key generated");
        GeneratedKey { key, record }
    }

    fn is_well_formed(&self, key: &str) -> bool {
        let mut parts = key.split('_');
        let (Some(prefix), Some(tag), Some(body), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let is_hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        prefix == self.prefix && is_hex(tag, KEY_TAG_BYTES * 2) && is_hex(body, KEY_BODY_BYTES * 2)
    }
}

/// Serializes JSON with object keys sorted at every level and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// HMAC-SHA256 request signatures in the wire format `t=<unix-ms>,s=<hex>`.
#[derive(Clone)]
pub struct RequestSigner {
    secret: Vec<u8>,
    tolerance_ms: u64,
}

impl RequestSigner {
    /// Fails if `signing.secret` is missing or shorter than 32 bytes.
    pub fn new(config: &SigningConfig) -> SecurityResult<Self> {
        let secret = require_secret(config.secret.as_deref(), "signing.secret")?;
        Ok(Self { secret, tolerance_ms: config.tolerance_ms })
    }

    pub fn sign(&self, payload: &Value) -> String {
        self.sign_at(payload, Utc::now().timestamp_millis())
    }

    pub fn sign_at(&self, payload: &Value, timestamp_ms: i64) -> String {
        format!("t={},s={}", timestamp_ms, self.mac(payload, timestamp_ms))
    }

    /// Verifies against the current time and the configured tolerance.
    pub fn verify(&self, payload: &Value, signature: &str) -> Verification {
        self.verify_at(payload, signature, Utc::now().timestamp_millis(), self.tolerance_ms)
    }

    pub fn verify_at(&self, payload: &Value, signature: &str, now_ms: i64, tolerance_ms: u64) -> Verification {
        let mut timestamp = None;
        let mut mac = None;
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", v)) => timestamp = Some(v),
                Some(("s", v)) => mac = Some(v),
                _ => {}
            }
        }
        let (Some(timestamp), Some(mac)) = (timestamp, mac) else {
            return Verification::fail("Invalid signature format");
        };
        if mac.is_empty() {
            return Verification::fail("Invalid signature format");
        }
        let Ok(timestamp) = timestamp.parse::<i64>() else {
            return Verification::fail("Invalid timestamp");
        };
        if now_ms.abs_diff(timestamp) > tolerance_ms {
            return Verification::fail("Signature expired");
        }

        let expected = self.mac(payload, timestamp);
        if constant_time_eq(expected.as_bytes(), mac.as_bytes()) {
            Verification::ok()
        } else {
            Verification::fail("Signature mismatch")
        }
    }

    fn mac(&self, payload: &Value, timestamp_ms: i64) -> String {
        let message = format!("{}.{}", timestamp_ms, canonical_json(payload));
        hmac_sha256_hex(&self.secret, message.as_bytes())
    }
}

/// Decides whether a bearer token is acceptable. Implementations may do I/O.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> bool;
}

#[async_trait]
impl TokenVerifier for ApiKeyManager {
    async fn verify(&self, token: &str) -> bool {
        self.validate_key(token).valid
    }
}

/// Adapts an async closure into a [`TokenVerifier`].
pub struct FnVerifier<F>(F);

#[async_trait]
impl<F, Fut> TokenVerifier for FnVerifier<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn verify(&self, token: &str) -> bool {
        (self.0)(token.to_string()).await
    }
}

/// Extracts `Authorization: Bearer <token>` and delegates validity to a verifier.
#[derive(Clone)]
pub struct BearerTokenValidator {
    verifier: Arc<dyn TokenVerifier>,
}

impl BearerTokenValidator {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::new(Arc::new(FnVerifier(f)))
    }

    /// Returns the token from a `Bearer` authorization value, or `None` for
    /// any other scheme or a malformed value.
    pub fn extract_token(authorization: &str) -> Option<&str> {
        let (scheme, token) = authorization.split_once(' ')?;
        let token = token.trim();
        if !scheme.eq_ignore_ascii_case("Bearer") || token.is_empty() || token.contains(char::is_whitespace) {
            return None;
        }
        Some(token)
    }

    pub async fn validate(&self, headers: &HeaderMap) -> Verification {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Verification::fail("Missing authorization header");
        };
        let Some(token) = value.to_str().ok().and_then(Self::extract_token) else {
            return Verification::fail("Invalid authorization header");
        };
        if self.verifier.verify(token).await {
            Verification::ok()
        } else {
            Verification::fail("Invalid token")
        }
    }
}

fn expiry_after(start: DateTime<Utc>, lifetime: ChronoDuration) -> DateTime<Utc> {
    start.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn manager() -> ApiKeyManager {
        ApiKeyManager::new(&ApiKeyConfig { prefix: "miyabi".to_string(), header_name: "X-API-Key".to_string() })
    }

    fn signer() -> RequestSigner {
        RequestSigner::new(&SigningConfig {
            secret: Some("a-very-long-signing-secret-of-32-bytes!".to_string()),
            tolerance_ms: 300_000,
            header_name: "X-Signature".to_string(),
        })
        .unwrap()
    }

    fn flip_last(s: &str) -> String {
        let mut out = s.to_string();
        let last = if out.ends_with('0') { "1" } else { "0" };
        out.replace_range(out.len() - 1.., last);
        out
    }

    #[test]
    fn test_key_format() {
        let generated = manager().generate_key(KeyOptions::default());
        let parts: Vec<&str> = generated.key.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "miyabi");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 64);
        assert_eq!(generated.record.prefix, parts[1]);
        assert_ne!(generated.record.key_hash, generated.key);
    }

    #[test]
    fn test_key_lifecycle() {
        let mgr = manager();
        let generated = mgr.generate_key(KeyOptions::default());
        let result = mgr.validate_key(&generated.key);
        assert!(result.valid);
        assert!(mgr.get_key(&generated.record.id).unwrap().last_used_at.is_some());

        assert!(!mgr.validate_key(&flip_last(&generated.key)).valid);

        assert!(mgr.revoke_key(&generated.record.id));
        let result = mgr.validate_key(&generated.key);
        assert!(!result.valid);
        assert_eq!(result.reason, Some("Key not found"));
        assert!(!mgr.revoke_key(&generated.record.id));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let mgr = manager();
        let generated = mgr.generate_key(KeyOptions::default());
        let wrong_prefix = generated.key.replacen("miyabi", "other", 1);
        for key in ["", "miyabi", "miyabi_abc_def", wrong_prefix.as_str()] {
            let result = mgr.validate_key(key);
            assert!(!result.valid);
            assert_eq!(result.reason, Some("Invalid key format"));
        }
    }

    #[test]
    fn test_scopes() {
        let mgr = manager();
        let read = mgr.generate_key(KeyOptions { scopes: vec!["read".to_string()], ..Default::default() });
        assert!(read.record.has_scope("read"));
        assert!(!read.record.has_scope("write"));
        assert!(!mgr.has_scope(&read.record.id, "write"));

        let admin = mgr.generate_key(KeyOptions { scopes: vec!["*".to_string()], ..Default::default() });
        assert!(mgr.has_scope(&admin.record.id, "anything"));
        assert!(!mgr.has_scope("unknown-id", "read"));
    }

    #[test]
    fn test_expired_key_returns_record() {
        let mgr = manager();
        let generated = mgr.generate_key(KeyOptions { expires_in_days: Some(1), ..Default::default() });
        mgr.keys.get_mut(&generated.record.id).unwrap().expires_at = Some(Utc::now() - ChronoDuration::seconds(1));

        let result = mgr.validate_key(&generated.key);
        assert!(!result.valid);
        assert_eq!(result.reason, Some("Key expired"));
        assert_eq!(result.key.unwrap().id, generated.record.id);

        assert_eq!(mgr.cleanup_expired(), 1);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_rotate_key() {
        let mgr = manager();
        let old = mgr.generate_key(KeyOptions {
            scopes: vec!["read".to_string(), "write".to_string()],
            expires_in_days: Some(30),
            metadata: Some(json!({"owner": "ci"})),
        });
        let new = mgr.rotate_key(&old.record.id).unwrap();

        assert!(!mgr.validate_key(&old.key).valid);
        assert!(mgr.validate_key(&new.key).valid);
        assert_ne!(old.record.id, new.record.id);
        assert_eq!(new.record.scopes, old.record.scopes);
        assert_eq!(new.record.metadata, Some(json!({"owner": "ci"})));
        assert!(new.record.expires_at.is_some());
        assert_eq!(mgr.len(), 1);
        assert!(mgr.rotate_key(&old.record.id).is_none());
    }

    #[test]
    fn test_huge_lifetime_is_clamped() {
        let mgr = manager();
        let generated = mgr.generate_key(KeyOptions { expires_in_days: Some(u32::MAX), ..Default::default() });
        let expires_at = generated.record.expires_at.unwrap();
        let lifetime = expires_at - generated.record.created_at;
        assert_eq!(lifetime, ChronoDuration::days(MAX_KEY_LIFETIME_DAYS.into()));
        assert!(mgr.validate_key(&generated.key).valid);

        let rotated = mgr.rotate_key(&generated.record.id).unwrap();
        assert!(rotated.record.expires_at.is_some());
        assert!(mgr.validate_key(&rotated.key).valid);
    }

    #[test]
    fn test_rotation_near_the_end_of_time_saturates() {
        let mgr = manager();
        let generated = mgr.generate_key(KeyOptions { expires_in_days: Some(1), ..Default::default() });
        // A record whose remaining lifetime cannot be added to "now" again
        mgr.keys.get_mut(&generated.record.id).unwrap().expires_at = Some(DateTime::<Utc>::MAX_UTC);

        let rotated = mgr.rotate_key(&generated.record.id).unwrap();
        assert_eq!(rotated.record.expires_at, Some(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_list_keys_hides_hash() {
        let mgr = manager();
        mgr.generate_key(KeyOptions::default());
        mgr.generate_key(KeyOptions::default());
        let keys = mgr.list_keys();
        assert_eq!(keys.len(), 2);
        let serialized = serde_json::to_value(&keys).unwrap();
        assert!(serialized[0].get("key_hash").is_none());
        assert!(serialized[0].get("prefix").is_some());
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"z": true, "y": null}], "c": "x"}});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":"x","d":[1,{"y":null,"z":true}]},"b":1}"#);
    }

    #[test]
    fn test_sign_and_verify() {
        let s = signer();
        let payload = json!({"event": "push", "id": 7});
        let signature = s.sign(&payload);
        assert!(signature.starts_with("t="));
        assert!(s.verify(&payload, &signature).valid);

        // Key order does not matter
        assert!(s.verify(&json!({"id": 7, "event": "push"}), &signature).valid);

        let tampered = s.verify(&json!({"event": "push", "id": 8}), &signature);
        assert_eq!(tampered.reason.as_deref(), Some("Signature mismatch"));
        assert!(!s.verify(&payload, &flip_last(&signature)).valid);
    }

    #[test]
    fn test_expired_signature() {
        let s = signer();
        let payload = json!({"a": 1});
        let signature = s.sign_at(&payload, 1000);
        let result = s.verify_at(&payload, &signature, 1000 + 400_000, 300_000);
        assert_eq!(result, Verification::fail("Signature expired"));
        assert!(s.verify_at(&payload, &signature, 1000 + 200_000, 300_000).valid);
        // Future timestamps are bounded too
        assert!(!s.verify_at(&payload, &signature, 1000 - 400_000, 300_000).valid);
    }

    #[test]
    fn test_malformed_signatures() {
        let s = signer();
        let payload = json!({"a": 1});
        let reason = |sig: &str| s.verify(&payload, sig).reason;
        assert_eq!(reason("").as_deref(), Some("Invalid signature format"));
        assert_eq!(reason("t=123").as_deref(), Some("Invalid signature format"));
        assert_eq!(reason("s=abcd").as_deref(), Some("Invalid signature format"));
        assert_eq!(reason("t=abc,s=abcd").as_deref(), Some("Invalid timestamp"));
        let now = Utc::now().timestamp_millis();
        assert_eq!(reason(&format!("t={},s=short", now)).as_deref(), Some("Signature mismatch"));
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(BearerTokenValidator::extract_token("Bearer abc123"), Some("abc123"));
        assert_eq!(BearerTokenValidator::extract_token("bearer abc123"), Some("abc123"));
        assert_eq!(BearerTokenValidator::extract_token("Basic abc123"), None);
        assert_eq!(BearerTokenValidator::extract_token("Bearer"), None);
        assert_eq!(BearerTokenValidator::extract_token("Bearer "), None);
        assert_eq!(BearerTokenValidator::extract_token("Bearer a b"), None);
    }

    #[tokio::test]
    async fn test_bearer_validator_with_closure() {
        let validator = BearerTokenValidator::from_fn(|token: String| async move { token == "good" });
        let mut headers = HeaderMap::new();
        assert_eq!(validator.validate(&headers).await.reason.as_deref(), Some("Missing authorization header"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Token good"));
        assert_eq!(validator.validate(&headers).await.reason.as_deref(), Some("Invalid authorization header"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer bad"));
        assert_eq!(validator.validate(&headers).await.reason.as_deref(), Some("Invalid token"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer good"));
        assert!(validator.validate(&headers).await.valid);
    }

    #[tokio::test]
    async fn test_bearer_validator_with_api_keys() {
        let mgr = manager();
        let generated = mgr.generate_key(KeyOptions::default());
        let validator = BearerTokenValidator::new(Arc::new(mgr));
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", generated.key)).unwrap());
        assert!(validator.validate(&headers).await.valid);
    }
}
