//! Response header composition: Content-Security-Policy and the standard
//! hardening headers.

use std::collections::{BTreeMap, HashSet};

use crate::config::{CspConfig, HeadersConfig};
use crate::crypto::random_hex;

const NONCE_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Sources(Vec<String>),
    Flag(bool),
}

/// Which directive a generated nonce is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTarget {
    Script,
    Style,
}

impl NonceTarget {
    fn directive(self) -> &'static str {
        match self {
            NonceTarget::Script => "script-src",
            NonceTarget::Style => "style-src",
        }
    }
}

/// Builds a `Content-Security-Policy` value from a directive map seeded with
/// restrictive defaults.
///
/// Directives keep their insertion order so the rendered header is stable.
#[derive(Debug, Clone)]
pub struct CspBuilder {
    directives: Vec<(String, Directive)>,
    nonces: HashSet<String>,
    report_uri: Option<String>,
    report_only: bool,
}

impl Default for CspBuilder {
    fn default() -> Self {
        let sources = |name: &str, values: &[&str]| {
            (name.to_string(), Directive::Sources(values.iter().map(|v| v.to_string()).collect()))
        };
        Self {
            directives: vec![
                sources("default-src", &["'self'"]),
                sources("script-src", &["'self'"]),
                sources("style-src", &["'self'"]),
                sources("img-src", &["'self'", "data:"]),
                sources("font-src", &["'self'"]),
                sources("connect-src", &["'self'"]),
                sources("object-src", &["'none'"]),
                sources("media-src", &["'self'"]),
                sources("frame-src", &["'none'"]),
                sources("frame-ancestors", &["'none'"]),
                sources("base-uri", &["'self'"]),
                sources("form-action", &["'self'"]),
                ("upgrade-insecure-requests".to_string(), Directive::Flag(true)),
            ],
            nonces: HashSet::new(),
            report_uri: None,
            report_only: false,
        }
    }
}

impl CspBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Secure defaults with the configured extra sources, report URI and mode applied.
    pub fn from_config(config: &CspConfig) -> Self {
        let mut builder = Self::default();
        for (directive, sources) in &config.extra_sources {
            for source in sources {
                builder.add_source(directive, source);
            }
        }
        if let Some(uri) = &config.report_uri {
            builder.report_uri(uri);
        }
        builder.report_only(config.report_only);
        builder
    }

    /// Appends `source` to `directive`, creating the directive if needed.
    ///
    /// A boolean directive of the same name is replaced by a source list.
    pub fn add_source(&mut self, directive: &str, source: &str) -> &mut Self {
        match self.directives.iter_mut().find(|(name, _)| name == directive) {
            Some((_, Directive::Sources(list))) => {
                if !list.iter().any(|s| s == source) {
                    list.push(source.to_string());
                }
            }
            Some((_, value)) => *value = Directive::Sources(vec![source.to_string()]),
            None => self.directives.push((directive.to_string(), Directive::Sources(vec![source.to_string()]))),
        }
        self
    }

    pub fn remove_source(&mut self, directive: &str, source: &str) -> &mut Self {
        if let Some((_, Directive::Sources(list))) = self.directives.iter_mut().find(|(name, _)| name == directive) {
            list.retain(|s| s != source);
        }
        self
    }

    /// Allows `domain` for scripts, styles, images, fonts and fetch/XHR.
    pub fn allow_domain(&mut self, domain: &str) -> &mut Self {
        for directive in ["script-src", "style-src", "img-src", "font-src", "connect-src"] {
            self.add_source(directive, domain);
        }
        self
    }

    pub fn allow_inline_scripts(&mut self) -> &mut Self {
        self.add_source("script-src", "'unsafe-inline'")
    }

    pub fn allow_inline_styles(&mut self) -> &mut Self {
        self.add_source("style-src", "'unsafe-inline'")
    }

    pub fn allow_eval(&mut self) -> &mut Self {
        self.add_source("script-src", "'unsafe-eval'")
    }

    /// Sets a keyword directive such as `upgrade-insecure-requests` or `block-all-mixed-content`.
    pub fn set_flag(&mut self, directive: &str, enabled: bool) -> &mut Self {
        match self.directives.iter_mut().find(|(name, _)| name == directive) {
            Some((_, value)) => *value = Directive::Flag(enabled),
            None => self.directives.push((directive.to_string(), Directive::Flag(enabled))),
        }
        self
    }

    /// Generates a fresh nonce, records it and allows it in the target directive.
    pub fn generate_nonce(&mut self, target: NonceTarget) -> String {
        let nonce = random_hex(NONCE_BYTES);
        self.nonces.insert(nonce.clone());
        self.add_source(target.directive(), &format!("'nonce-{}'", nonce));
        nonce
    }

    pub fn nonces(&self) -> impl Iterator<Item = &str> {
        self.nonces.iter().map(String::as_str)
    }

    /// Forgets all issued nonces and removes them from every directive.
    pub fn clear_nonces(&mut self) -> &mut Self {
        for (_, value) in self.directives.iter_mut() {
            if let Directive::Sources(list) = value {
                list.retain(|s| !s.starts_with("'nonce-"));
            }
        }
        self.nonces.clear();
        self
    }

    pub fn report_uri(&mut self, uri: &str) -> &mut Self {
        self.report_uri = Some(uri.to_string());
        self
    }

    pub fn report_only(&mut self, enabled: bool) -> &mut Self {
        self.report_only = enabled;
        self
    }

    pub fn header_name(&self) -> &'static str {
        if self.report_only {
            "Content-Security-Policy-Report-Only"
        } else {
            "Content-Security-Policy"
        }
    }

    /// Renders the policy. Empty and disabled directives are omitted.
    pub fn build(&self) -> String {
        let mut parts: Vec<String> = self
            .directives
            .iter()
            .filter_map(|(name, value)| match value {
                Directive::Flag(true) => Some(name.clone()),
                Directive::Flag(false) => None,
                Directive::Sources(list) if list.is_empty() => None,
                Directive::Sources(list) => Some(format!("{} {}", name, list.join(" "))),
            })
            .collect();
        if let Some(uri) = &self.report_uri {
            parts.push(format!("report-uri {}", uri));
        }
        parts.join("; ")
    }
}

/// Renders the non-CSP hardening headers from configuration.
#[derive(Debug, Clone)]
pub struct SecurityHeadersBuilder {
    config: HeadersConfig,
}

impl SecurityHeadersBuilder {
    pub fn new(config: HeadersConfig) -> Self {
        Self { config }
    }

    /// Header name to value, e.g. `X-Frame-Options` to `DENY`.
    pub fn build(&self) -> BTreeMap<String, String> {
        let cfg = &self.config;
        let mut headers = BTreeMap::new();

        if cfg.enable_hsts {
            let mut hsts = format!("max-age={}", cfg.hsts_max_age);
            if cfg.hsts_include_subdomains {
                hsts.push_str("; includeSubDomains");
            }
            if cfg.hsts_preload {
                hsts.push_str("; preload");
            }
            headers.insert("Strict-Transport-Security".to_string(), hsts);
        }

        headers.insert("X-Frame-Options".to_string(), cfg.frame_options.clone());
        headers.insert("X-Content-Type-Options".to_string(), "nosniff".to_string());
        headers.insert("X-XSS-Protection".to_string(), "1; mode=block".to_string());
        headers.insert("Referrer-Policy".to_string(), cfg.referrer_policy.clone());

        if !cfg.permissions_policy.is_empty() {
            headers.insert("Permissions-Policy".to_string(), render_permissions_policy(&cfg.permissions_policy));
        }
        if let Some(coop) = &cfg.cross_origin_opener_policy {
            headers.insert("Cross-Origin-Opener-Policy".to_string(), coop.clone());
        }
        if let Some(corp) = &cfg.cross_origin_resource_policy {
            headers.insert("Cross-Origin-Resource-Policy".to_string(), corp.clone());
        }

        headers
    }
}

/// `camera=(), geolocation=(self "https://maps.example.com")`
fn render_permissions_policy(policy: &BTreeMap<String, Vec<String>>) -> String {
    policy
        .iter()
        .map(|(feature, allow)| {
            let list: Vec<String> = allow
                .iter()
                .map(|origin| match origin.trim_matches('\'') {
                    "self" => "self".to_string(),
                    "*" => "*".to_string(),
                    other => format!("\"{}\"", other),
                })
                .collect();
            format!("{}=({})", feature, list.join(" "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_POLICY: &str = "default-src 'self'; script-src 'self'; style-src 'self'; \
        img-src 'self' data:; font-src 'self'; connect-src 'self'; object-src 'none'; \
        media-src 'self'; frame-src 'none'; frame-ancestors 'none'; base-uri 'self'; \
        form-action 'self'; upgrade-insecure-requests";

    fn headers_config() -> HeadersConfig {
        HeadersConfig {
            enable_hsts: true,
            hsts_max_age: 31_536_000,
            hsts_include_subdomains: true,
            hsts_preload: false,
            frame_options: "DENY".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            permissions_policy: BTreeMap::from([
                ("camera".to_string(), vec![]),
                ("geolocation".to_string(), vec!["self".to_string(), "https://maps.example.com".to_string()]),
            ]),
            cross_origin_opener_policy: Some("same-origin".to_string()),
            cross_origin_resource_policy: None,
        }
    }

    #[test]
    fn test_default_policy() {
        let csp = CspBuilder::new();
        assert_eq!(csp.build(), DEFAULT_POLICY);
        assert_eq!(csp.header_name(), "Content-Security-Policy");
    }

    #[test]
    fn test_mutators() {
        let mut csp = CspBuilder::new();
        csp.allow_inline_styles().allow_eval().add_source("worker-src", "'self'");
        csp.remove_source("img-src", "data:");
        let policy = csp.build();
        assert!(policy.contains("style-src 'self' 'unsafe-inline'"));
        assert!(policy.contains("script-src 'self' 'unsafe-eval'"));
        assert!(policy.contains("img-src 'self';"));
        assert!(policy.ends_with("worker-src 'self'"));

        // Duplicate sources are not repeated
        csp.allow_eval();
        assert_eq!(csp.build().matches("'unsafe-eval'").count(), 1);
    }

    #[test]
    fn test_allow_domain() {
        let mut csp = CspBuilder::new();
        csp.allow_domain("https://cdn.example.com");
        let policy = csp.build();
        assert!(policy.contains("script-src 'self' https://cdn.example.com"));
        assert!(policy.contains("connect-src 'self' https://cdn.example.com"));
        assert!(policy.contains("default-src 'self';"));
    }

    #[test]
    fn test_empty_and_false_directives_omitted() {
        let mut csp = CspBuilder::new();
        csp.remove_source("object-src", "'none'").set_flag("upgrade-insecure-requests", false);
        let policy = csp.build();
        assert!(!policy.contains("object-src"));
        assert!(!policy.contains("upgrade-insecure-requests"));

        csp.set_flag("block-all-mixed-content", true);
        assert!(csp.build().ends_with("block-all-mixed-content"));
    }

    #[test]
    fn test_nonces() {
        let mut csp = CspBuilder::new();
        let a = csp.generate_nonce(NonceTarget::Script);
        let b = csp.generate_nonce(NonceTarget::Style);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(csp.nonces().count(), 2);
        let policy = csp.build();
        assert!(policy.contains(&format!("script-src 'self' 'nonce-{}'", a)));
        assert!(policy.contains(&format!("style-src 'self' 'nonce-{}'", b)));

        csp.clear_nonces();
        assert_eq!(csp.nonces().count(), 0);
        assert_eq!(csp.build(), DEFAULT_POLICY);
    }

    #[test]
    fn test_from_config_report_only() {
        let config = CspConfig {
            report_uri: Some("/csp-report".to_string()),
            report_only: true,
            extra_sources: BTreeMap::from([("connect-src".to_string(), vec!["wss://ws.example.com".to_string()])]),
        };
        let csp = CspBuilder::from_config(&config);
        assert_eq!(csp.header_name(), "Content-Security-Policy-Report-Only");
        let policy = csp.build();
        assert!(policy.contains("connect-src 'self' wss://ws.example.com"));
        assert!(policy.ends_with("; report-uri /csp-report"));
    }

    #[test]
    fn test_security_headers() {
        let headers = SecurityHeadersBuilder::new(headers_config()).build();
        assert_eq!(headers["Strict-Transport-Security"], "max-age=31536000; includeSubDomains");
        assert_eq!(headers["X-Frame-Options"], "DENY");
        assert_eq!(headers["X-Content-Type-Options"], "nosniff");
        assert_eq!(headers["X-XSS-Protection"], "1; mode=block");
        assert_eq!(headers["Referrer-Policy"], "strict-origin-when-cross-origin");
        assert_eq!(headers["Permissions-Policy"], "camera=(), geolocation=(self \"https://maps.example.com\")");
        assert_eq!(headers["Cross-Origin-Opener-Policy"], "same-origin");
        assert!(!headers.contains_key("Cross-Origin-Resource-Policy"));
    }

    #[test]
    fn test_hsts_disabled_and_preload() {
        let mut cfg = headers_config();
        cfg.hsts_preload = true;
        let headers = SecurityHeadersBuilder::new(cfg.clone()).build();
        assert_eq!(headers["Strict-Transport-Security"], "max-age=31536000; includeSubDomains; preload");

        cfg.enable_hsts = false;
        cfg.permissions_policy.clear();
        let headers = SecurityHeadersBuilder::new(cfg).build();
        assert!(!headers.contains_key("Strict-Transport-Security"));
        assert!(!headers.contains_key("Permissions-Policy"));
    }
}
