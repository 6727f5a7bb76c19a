//! Cross-module tests for the security toolkit.
//!
//! ## Test Modules
//!
//! - **config_tests**: Configuration loading, layering and validation
//! - **error_tests**: Error display and HTTP error envelopes
//! - **service_tests**: The `SecurityService` façade wiring
//! - **api_tests**: The demo router driven end to end through its middleware
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test
//! cargo test api_tests
//! ```

pub mod error_tests;

use crate::config::SecurityConfig;

pub const TEST_CSRF_SECRET: &str = "test-csrf-secret-0123456789abcdef0123";
pub const TEST_SIGNING_SECRET: &str = "test-signing-secret-0123456789abcdef01";

/// Embedded defaults plus the secrets the service refuses to start without.
pub fn test_config() -> SecurityConfig {
    let mut cfg = SecurityConfig::default();
    cfg.csrf.secret = Some(TEST_CSRF_SECRET.to_string());
    cfg.signing.secret = Some(TEST_SIGNING_SECRET.to_string());
    cfg
}
