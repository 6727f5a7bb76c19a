//! Cross-Site Request Forgery defenses.
//!
//! Three independent strategies are provided:
//!
//! - [`CsrfProtection`]: stateless signed tokens of the form `salt:signature`,
//!   optionally bound to a session id.
//! - [`OriginValidator`]: `Origin`/`Referer`/`Host` header checks against an allow-list.
//! - [`DoubleSubmitCookie`]: an opaque random value mirrored into a cookie and a header.
//!
//! None of the validation paths return errors. Malformed input is simply invalid.

use std::collections::HashSet;

use axum::http::{header, HeaderMap};
use url::Url;

use crate::config::{CookieConfig, CorsConfig, CsrfConfig};
use crate::crypto::{constant_time_eq, hmac_sha256_hex, random_hex};
use crate::error::{SecurityError, SecurityResult};

/// Minimum accepted length, in bytes, for HMAC secrets.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Checks that a configured secret is present and long enough.
pub(crate) fn require_secret(secret: Option<&str>, name: &str) -> SecurityResult<Vec<u8>> {
    match secret {
        None => Err(SecurityError::Config(format!("{} is not set", name))),
        Some(s) if s.len() < MIN_SECRET_LENGTH => Err(SecurityError::Config(format!(
            "{} must be at least {} bytes",
            name, MIN_SECRET_LENGTH
        ))),
        Some(s) => Ok(s.as_bytes().to_vec()),
    }
}

/// Renders a `Set-Cookie` header value.
///
/// `http_only` is passed separately so the double-submit cookie can be
/// readable by client script while sharing the rest of the attributes.
pub fn format_cookie(config: &CookieConfig, value: &str, http_only: bool) -> String {
    let mut cookie = format!("{}={}; Path={}", config.name, value, config.path);
    if let Some(domain) = &config.domain {
        cookie.push_str(&format!("; Domain={}", domain));
    }
    if let Some(max_age) = config.max_age {
        cookie.push_str(&format!("; Max-Age={}", max_age));
    }
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if config.secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str(&format!("; SameSite={}", config.same_site));
    cookie
}

/// Looks up a cookie by name across all `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

/// Stateless CSRF tokens: `salt:HMAC(secret, salt[:session_id])`.
#[derive(Clone)]
pub struct CsrfProtection {
    secret: Vec<u8>,
    config: CsrfConfig,
}

impl CsrfProtection {
    /// Fails if `csrf.secret` is missing or shorter than 32 bytes.
    pub fn new(config: &CsrfConfig) -> SecurityResult<Self> {
        let secret = require_secret(config.secret.as_deref(), "csrf.secret")?;
        Ok(Self { secret, config: config.clone() })
    }

    /// Issues a new token, bound to `session_id` when one is given.
    pub fn generate_token(&self, session_id: Option<&str>) -> String {
        let salt = random_hex(self.config.token_length);
        let signature = self.sign(&salt, session_id);
        format!("{}:{}", salt, signature)
    }

    /// Recomputes the signature and compares it in constant time.
    ///
    /// A token bound to a session only validates against that same session,
    /// and an unbound token only validates without one. Validation does not
    /// consume the token.
    pub fn validate_token(&self, token: &str, session_id: Option<&str>) -> bool {
        let mut parts = token.split(':');
        let (Some(salt), Some(signature), None) = (parts.next(), parts.next(), parts.next()) else {
            return false;
        };
        if salt.is_empty() || signature.is_empty() {
            return false;
        }
        let expected = self.sign(salt, session_id);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    /// `Set-Cookie` value carrying `token` with the configured attributes.
    pub fn cookie_header(&self, token: &str) -> String {
        format_cookie(&self.config.cookie, token, self.config.cookie.http_only)
    }

    /// Reads the token from the configured request header.
    pub fn extract_token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(self.config.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    /// Reads the optional session id used for token binding.
    pub fn extract_session<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(self.config.session_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    fn sign(&self, salt: &str, session_id: Option<&str>) -> String {
        let message = match session_id {
            Some(sid) => format!("{}:{}", salt, sid),
            None => salt.to_string(),
        };
        hmac_sha256_hex(&self.secret, message.as_bytes())
    }
}

/// Result of [`OriginValidator::validate_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl OriginCheck {
    fn ok() -> Self {
        Self { valid: true, reason: None }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

/// Allow-list checks on `Origin`, `Referer` and `Host`.
#[derive(Debug, Clone)]
pub struct OriginValidator {
    allowed_origins: HashSet<String>,
    allowed_hosts: HashSet<String>,
}

impl OriginValidator {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.iter().map(|o| o.trim_end_matches('/').to_string()).collect(),
            allowed_hosts: config.allowed_hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }

    /// Passes if the literal origin is allow-listed or its host is.
    pub fn validate_origin(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins.contains(origin) || self.host_allowed(origin)
    }

    /// Passes when no referer is present; otherwise its host must be allow-listed.
    pub fn validate_referer(&self, referer: Option<&str>) -> bool {
        match referer {
            None => true,
            Some(r) => self.host_allowed(r),
        }
    }

    /// Requires a `Host` header, and each of `Origin`/`Referer` that is present must pass.
    pub fn validate_request(&self, headers: &HeaderMap) -> OriginCheck {
        if !headers.contains_key(header::HOST) {
            return OriginCheck::fail("Missing Host header");
        }

        if let Some(origin) = headers.get(header::ORIGIN) {
            let valid = origin.to_str().map(|o| self.validate_origin(o)).unwrap_or(false);
            if !valid {
                return OriginCheck::fail("Invalid origin");
            }
        }

        if let Some(referer) = headers.get(header::REFERER) {
            let valid = referer.to_str().map(|r| self.validate_referer(Some(r))).unwrap_or(false);
            if !valid {
                return OriginCheck::fail("Invalid referer");
            }
        }

        OriginCheck::ok()
    }

    fn host_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else { return false };
        let Some(host) = parsed.host_str() else { return false };
        let host = host.to_ascii_lowercase();
        if self.allowed_hosts.contains(&host) {
            return true;
        }
        parsed
            .port()
            .is_some_and(|port| self.allowed_hosts.contains(&format!("{}:{}", host, port)))
    }
}

/// Double-submit cookie strategy: the same random value in a cookie and a header.
#[derive(Debug, Clone)]
pub struct DoubleSubmitCookie {
    cookie: CookieConfig,
    header_name: String,
    token_length: usize,
}

impl DoubleSubmitCookie {
    pub fn new(config: &CsrfConfig) -> Self {
        Self {
            cookie: config.cookie.clone(),
            header_name: config.header_name.clone(),
            token_length: config.token_length,
        }
    }

    pub fn generate_token(&self) -> String {
        random_hex(self.token_length)
    }

    /// Both sides must be present and byte-identical.
    pub fn validate(&self, cookie_token: Option<&str>, header_token: Option<&str>) -> bool {
        match (cookie_token, header_token) {
            (Some(c), Some(h)) if !c.is_empty() => constant_time_eq(c.as_bytes(), h.as_bytes()),
            _ => false,
        }
    }

    pub fn validate_request(&self, headers: &HeaderMap) -> bool {
        let cookie = read_cookie(headers, &self.cookie.name);
        let header = headers.get(self.header_name.as_str()).and_then(|v| v.to_str().ok());
        self.validate(cookie.as_deref(), header)
    }

    /// The cookie is never `HttpOnly`; client script must read it to mirror it into the header.
    pub fn cookie_header(&self, token: &str) -> String {
        format_cookie(&self.cookie, token, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SameSite;
    use axum::http::HeaderValue;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn csrf_config() -> CsrfConfig {
        CsrfConfig {
            secret: Some(SECRET.to_string()),
            token_length: 32,
            header_name: "X-CSRF-Token".to_string(),
            session_header: "X-Session-Id".to_string(),
            cookie: CookieConfig::default(),
        }
    }

    #[test]
    fn test_secret_is_required() {
        let mut cfg = csrf_config();
        cfg.secret = None;
        assert!(matches!(CsrfProtection::new(&cfg), Err(SecurityError::Config(_))));
        cfg.secret = Some("too-short".to_string());
        assert!(matches!(CsrfProtection::new(&cfg), Err(SecurityError::Config(_))));
    }

    #[test]
    fn test_token_round_trip_and_session_binding() {
        let csrf = CsrfProtection::new(&csrf_config()).unwrap();
        let token = csrf.generate_token(Some("session-a"));
        assert!(csrf.validate_token(&token, Some("session-a")));
        // Not consumed on validation
        assert!(csrf.validate_token(&token, Some("session-a")));
        assert!(!csrf.validate_token(&token, Some("session-b")));
        assert!(!csrf.validate_token(&token, None));

        let unbound = csrf.generate_token(None);
        assert!(csrf.validate_token(&unbound, None));
        assert!(!csrf.validate_token(&unbound, Some("session-a")));
    }

    #[test]
    fn test_token_shape() {
        let csrf = CsrfProtection::new(&csrf_config()).unwrap();
        let token = csrf.generate_token(None);
        let (salt, sig) = token.split_once(':').unwrap();
        assert_eq!(salt.len(), 64);
        assert_eq!(sig.len(), 64);
        assert_ne!(token, csrf.generate_token(None));
    }

    #[test]
    fn test_malformed_tokens_fail_closed() {
        let csrf = CsrfProtection::new(&csrf_config()).unwrap();
        let token = csrf.generate_token(None);
        assert!(!csrf.validate_token("", None));
        assert!(!csrf.validate_token("no-colon", None));
        assert!(!csrf.validate_token(&format!("{}:extra", token), None));
        assert!(!csrf.validate_token(":abc", None));

        let (salt, sig) = token.split_once(':').unwrap();
        assert!(!csrf.validate_token(&format!("{}:{}", salt, &sig[..10]), None));
        let mut flipped = sig.to_string();
        let last = if flipped.ends_with('0') { "1" } else { "0" };
        flipped.replace_range(63..64, last);
        assert!(!csrf.validate_token(&format!("{}:{}", salt, flipped), None));
    }

    #[test]
    fn test_tokens_from_other_secret_rejected() {
        let a = CsrfProtection::new(&csrf_config()).unwrap();
        let mut cfg = csrf_config();
        cfg.secret = Some("ffffffffffffffffffffffffffffffffffff".to_string());
        let b = CsrfProtection::new(&cfg).unwrap();
        assert!(!b.validate_token(&a.generate_token(None), None));
    }

    #[test]
    fn test_cookie_rendering() {
        let mut cfg = csrf_config();
        cfg.cookie.domain = Some("example.com".to_string());
        cfg.cookie.max_age = Some(3600);
        let csrf = CsrfProtection::new(&cfg).unwrap();
        assert_eq!(
            csrf.cookie_header("tok"),
            "_csrf=tok; Path=/; Domain=example.com; Max-Age=3600; HttpOnly; Secure; SameSite=Strict"
        );

        cfg.cookie.http_only = false;
        cfg.cookie.secure = false;
        cfg.cookie.same_site = SameSite::Lax;
        cfg.cookie.domain = None;
        cfg.cookie.max_age = None;
        let csrf = CsrfProtection::new(&cfg).unwrap();
        assert_eq!(csrf.cookie_header("tok"), "_csrf=tok; Path=/; SameSite=Lax");
    }

    #[test]
    fn test_extract_token() {
        let csrf = CsrfProtection::new(&csrf_config()).unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(csrf.extract_token(&headers), None);
        headers.insert("x-csrf-token", HeaderValue::from_static("abc:def"));
        assert_eq!(csrf.extract_token(&headers), Some("abc:def"));
    }

    fn origin_validator() -> OriginValidator {
        OriginValidator::new(&CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            allowed_hosts: vec!["localhost:8080".to_string(), "api.example.com".to_string()],
        })
    }

    #[test]
    fn test_validate_origin() {
        let v = origin_validator();
        assert!(v.validate_origin("https://app.example.com"));
        assert!(v.validate_origin("https://app.example.com/"));
        assert!(v.validate_origin("http://localhost:8080"));
        assert!(v.validate_origin("https://api.example.com"));
        assert!(!v.validate_origin("https://evil.example.com"));
        assert!(!v.validate_origin("http://localhost:9090"));
        assert!(!v.validate_origin("null"));
    }

    #[test]
    fn test_validate_referer() {
        let v = origin_validator();
        assert!(v.validate_referer(None));
        assert!(v.validate_referer(Some("https://api.example.com/some/page?x=1")));
        assert!(!v.validate_referer(Some("https://evil.com/page")));
        assert!(!v.validate_referer(Some("not a url")));
    }

    #[test]
    fn test_validate_request() {
        let v = origin_validator();
        let mut headers = HeaderMap::new();
        let check = v.validate_request(&headers);
        assert!(!check.valid);
        assert_eq!(check.reason.as_deref(), Some("Missing Host header"));

        headers.insert(header::HOST, HeaderValue::from_static("api.example.com"));
        assert!(v.validate_request(&headers).valid);

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        headers.insert(header::REFERER, HeaderValue::from_static("https://evil.com/"));
        let check = v.validate_request(&headers);
        assert!(!check.valid);
        assert_eq!(check.reason.as_deref(), Some("Invalid referer"));

        headers.insert(header::REFERER, HeaderValue::from_static("https://api.example.com/form"));
        assert!(v.validate_request(&headers).valid);

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.com"));
        assert_eq!(v.validate_request(&headers).reason.as_deref(), Some("Invalid origin"));
    }

    #[test]
    fn test_double_submit_cookie() {
        let dsc = DoubleSubmitCookie::new(&csrf_config());
        let token = dsc.generate_token();
        assert_eq!(token.len(), 64);
        assert!(dsc.validate(Some(&token), Some(&token)));
        assert!(!dsc.validate(Some(&token), None));
        assert!(!dsc.validate(None, Some(&token)));
        assert!(!dsc.validate(Some(""), Some("")));
        assert!(!dsc.validate(Some(&token), Some(&token[1..])));

        let cookie = dsc.cookie_header(&token);
        assert!(!cookie.contains("HttpOnly"));
        assert!(cookie.starts_with(&format!("_csrf={}", token)));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(&format!("theme=dark; _csrf={}", token)).unwrap());
        assert!(!dsc.validate_request(&headers));
        headers.insert("x-csrf-token", HeaderValue::from_str(&token).unwrap());
        assert!(dsc.validate_request(&headers));
    }
}
