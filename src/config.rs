use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    /// Empty means the socket address is always the client.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_requests: u32,
    pub skip_successful_requests: bool,
    pub skip_failed_requests: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Fraction of the delay used as symmetric jitter, in `[0, 1]`.
    pub jitter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    /// Max-Age in seconds.
    pub max_age: Option<u64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "_csrf".to_string(),
            path: "/".to_string(),
            domain: None,
            max_age: None,
            http_only: true,
            secure: true,
            same_site: SameSite::Strict,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    pub secret: Option<String>,
    /// Salt length in bytes.
    pub token_length: usize,
    pub header_name: String,
    pub session_header: String,
    pub cookie: CookieConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CspConfig {
    pub report_uri: Option<String>,
    pub report_only: bool,
    /// Additional sources per directive, merged over the secure defaults.
    #[serde(default)]
    pub extra_sources: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadersConfig {
    pub enable_hsts: bool,
    pub hsts_max_age: u64,
    pub hsts_include_subdomains: bool,
    pub hsts_preload: bool,
    pub frame_options: String,
    pub referrer_policy: String,
    #[serde(default)]
    pub permissions_policy: BTreeMap<String, Vec<String>>,
    pub cross_origin_opener_policy: Option<String>,
    pub cross_origin_resource_policy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SanitizerConfig {
    pub max_html_length: usize,
    pub max_prompt_length: usize,
    pub max_filename_length: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self { max_html_length: 50_000, max_prompt_length: 10_000, max_filename_length: 255 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub prefix: String,
    pub header_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    pub secret: Option<String>,
    pub tolerance_ms: u64,
    pub header_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub max_size_bytes: u64,
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

/// Token parameters handed to whatever issues JWTs upstream; this crate only carries them.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub backoff: BackoffConfig,
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub csp: CspConfig,
    pub headers: HeadersConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    pub api_keys: ApiKeyConfig,
    pub signing: SigningConfig,
    pub upload: UploadConfig,
    pub password: PasswordConfig,
    pub jwt: JwtConfig,
}

const DEFAULTS: &str = include_str!("../config/default.toml");

impl Default for SecurityConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
            .build()
        {
            Ok(cfg) => match cfg.try_deserialize() {
                Ok(sec_cfg) => sec_cfg,
                Err(e) => {
                    eprintln!("FATAL: Failed to deserialize default config: {}", e);
                    panic!("Failed to deserialize default config: {}", e);
                }
            },
            Err(e) => {
                eprintln!("FATAL: Failed to parse default config: {}", e);
                panic!("Failed to parse default config: {}", e);
            }
        }
    }
}

pub fn load() -> anyhow::Result<SecurityConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: miyabi-security.toml (in CWD)
        .add_source(::config::File::with_name("miyabi-security").required(false));

    if let Ok(custom_path) = std::env::var("MIYABI_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(
        ::config::Environment::with_prefix("MIYABI")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("server.trusted_proxies")
            .with_list_parse_key("cors.allowed_origins")
            .with_list_parse_key("cors.allowed_hosts")
            .with_list_parse_key("upload.allowed_mime_types")
            .try_parsing(true),
    );

    let cfg = builder.build()?;
    let sec_cfg: SecurityConfig = cfg.try_deserialize()?;
    validate(&sec_cfg)?;
    Ok(sec_cfg)
}

pub fn validate(cfg: &SecurityConfig) -> anyhow::Result<()> {
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }

    // Rate limiting
    if cfg.rate_limit.window_ms == 0 {
        return Err(anyhow::anyhow!("rate_limit.window_ms must be > 0"));
    }
    if cfg.rate_limit.max_requests == 0 {
        return Err(anyhow::anyhow!("rate_limit.max_requests must be > 0"));
    }
    if cfg.rate_limit.skip_successful_requests && cfg.rate_limit.skip_failed_requests {
        tracing::warn!("rate_limit skips both successful and failed requests; nothing will be counted");
    }

    // Backoff
    if cfg.backoff.base_delay_ms == 0 {
        return Err(anyhow::anyhow!("backoff.base_delay_ms must be > 0"));
    }
    if cfg.backoff.max_delay_ms < cfg.backoff.base_delay_ms {
        return Err(anyhow::anyhow!("backoff.max_delay_ms must be >= base_delay_ms"));
    }
    if !(cfg.backoff.factor >= 1.0) {
        return Err(anyhow::anyhow!("backoff.factor must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&cfg.backoff.jitter) {
        return Err(anyhow::anyhow!("backoff.jitter must be in 0.0..=1.0"));
    }

    // CSRF
    if !(16..=128).contains(&cfg.csrf.token_length) {
        return Err(anyhow::anyhow!("csrf.token_length must be in 16..=128"));
    }
    if cfg.csrf.cookie.same_site == SameSite::None && !cfg.csrf.cookie.secure {
        return Err(anyhow::anyhow!("csrf.cookie.same_site=None requires csrf.cookie.secure=true"));
    }

    // Signing
    if cfg.signing.tolerance_ms == 0 {
        return Err(anyhow::anyhow!("signing.tolerance_ms must be > 0"));
    }

    // Sanitizer
    if cfg.sanitizer.max_html_length == 0 || cfg.sanitizer.max_prompt_length == 0 {
        return Err(anyhow::anyhow!("sanitizer max lengths must be > 0"));
    }
    if cfg.sanitizer.max_filename_length == 0 || cfg.sanitizer.max_filename_length > 255 {
        return Err(anyhow::anyhow!("sanitizer.max_filename_length must be in 1..=255"));
    }

    // API keys
    if cfg.api_keys.prefix.is_empty() || !cfg.api_keys.prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow::anyhow!("api_keys.prefix must be non-empty ASCII alphanumeric"));
    }

    if cfg.password.min_length < 8 {
        return Err(anyhow::anyhow!("password.min_length must be >= 8"));
    }
    if cfg.jwt.expires_in_secs == 0 {
        return Err(anyhow::anyhow!("jwt.expires_in_secs must be > 0"));
    }

    Ok(())
}
