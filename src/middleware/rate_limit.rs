use super::ip::client_ip;
use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::SecurityError;
use crate::rate_limit::RateLimitInfo;
use crate::service::SecurityService;

/// An Axum middleware for per-client rate limiting.
///
/// The client is identified by IP (see [`client_ip`]); forwarding headers only
/// count when the peer is listed in `server.trusted_proxies`. The limiter is checked
/// before the handler runs and the request is recorded afterwards, with
/// `success` meaning a status below 400.
///
/// Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
/// `X-RateLimit-Reset` (unix seconds); rejected requests get a 429 with `Retry-After`.
pub async fn rate_limit_middleware(
    State(security): State<Arc<SecurityService>>,
    req: Request,
    next: Next,
) -> Response {
    let id = client_ip(&req, &security.config().server.trusted_proxies).to_string();

    let info = security.check_rate_limit(&id);
    if !info.allowed {
        let retry_after_seconds = info.retry_after_secs().unwrap_or(1);
        let mut res = SecurityError::RateLimited { retry_after_seconds }.into_response();
        apply_rate_limit_headers(&mut res, &info);
        return res;
    }

    let mut res = next.run(req).await;
    let success = res.status().as_u16() < 400;
    let info = security.record_request(&id, success);
    apply_rate_limit_headers(&mut res, &info);
    res
}

fn apply_rate_limit_headers(res: &mut Response, info: &RateLimitInfo) {
    let headers = res.headers_mut();
    headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(info.limit));
    headers.insert(HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(info.remaining));
    headers.insert(HeaderName::from_static("x-ratelimit-reset"), HeaderValue::from(info.reset_time.timestamp()));
}
