//! # Miyabi Security
//!
//! Composable defensive primitives for HTTP services, wired behind a single
//! [`service::SecurityService`] façade.
//!
//! ## Core Components
//!
//! - [`sanitizer`]: HTML, text, prompt, filename, path, SQL, JSON and URL sanitization
//! - [`validator`]: declarative per-field validation with stable error codes
//! - [`rate_limit`]: fixed-window request counting with blocking
//! - [`backoff`]: exponential retry delays with jitter
//! - [`csrf`]: signed tokens, origin checks and double-submit cookies
//! - [`headers`]: Content-Security-Policy and hardening header builders
//! - [`auth`]: API key lifecycle, HMAC request signing, bearer tokens
//! - [`service`]: the façade owning one instance of each component
//!
//! ## Supporting Modules
//!
//! - [`config`]: layered configuration (embedded defaults, files, environment)
//! - [`error`]: error type and HTTP error responses
//! - [`metrics`]: counters for security decisions
//! - [`middleware`] and [`routes`]: axum adapters and the demo server's handlers
//!
//! Validation, sanitization and verification never fail with an error; they
//! return structured results. Only configuration problems at construction time
//! are errors.

pub mod auth;
pub mod backoff;
pub mod config;
pub mod crypto;
pub mod csrf;
pub mod error;
pub mod headers;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod sanitizer;
pub mod service;
pub mod validator;

#[cfg(test)]
mod tests;
