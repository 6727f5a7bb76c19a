use axum::{
    extract::{connect_info::ConnectInfo, Request},
    http::HeaderMap,
};
use std::net::{IpAddr, SocketAddr};

/// Extract the client IP, honouring proxy headers only from trusted peers.
///
/// When `peer` is one of `trusted_proxies`, the `X-Forwarded-For` chain is read
/// right to left and the first address that is not itself a trusted proxy wins;
/// `X-Real-IP` is the fallback. Otherwise the headers are ignored and the peer
/// address is the client. Without a peer address the result is loopback.
pub fn extract_ip_from_headers(headers: &HeaderMap, peer: Option<IpAddr>, trusted_proxies: &[IpAddr]) -> IpAddr {
    let Some(peer) = peer else {
        return IpAddr::from([127, 0, 0, 1]);
    };
    if !trusted_proxies.contains(&peer) {
        return peer;
    }

    if let Some(h) = headers.get("x-forwarded-for").and_then(|hv| hv.to_str().ok()) {
        let chain: Vec<IpAddr> = h.split(',').filter_map(|entry| entry.trim().parse().ok()).collect();
        if let Some(client) = chain.iter().rev().find(|ip| !trusted_proxies.contains(ip)) {
            return *client;
        }
        if let Some(first) = chain.first() {
            return *first;
        }
    }
    if let Some(h) = headers.get("x-real-ip").and_then(|hv| hv.to_str().ok()) {
        if let Ok(ip) = h.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    peer
}

/// Rate-limit identifier for a request. Works with or without `ConnectInfo`.
pub fn client_ip(req: &Request, trusted_proxies: &[IpAddr]) -> IpAddr {
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip());
    extract_ip_from_headers(req.headers(), peer, trusted_proxies)
}
