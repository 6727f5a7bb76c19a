//! Middleware components for HTTP request processing.
//!
//! Thin axum adapters over [`SecurityService`](crate::service::SecurityService):
//! rate limiting, CSRF/origin checks, response hardening headers, API-key
//! authentication and client identification. All of them take the service as
//! router state via `from_fn_with_state`.

pub mod auth;
pub mod csrf;
pub mod ip;
pub mod rate_limit;
pub mod security_headers;

pub use security_headers::CspNonce;
