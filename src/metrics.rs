use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters for security decisions, exposed on `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    pub requests_allowed: Arc<AtomicU64>,
    pub requests_limited: Arc<AtomicU64>,
    pub csrf_failures: Arc<AtomicU64>,
    pub auth_failures: Arc<AtomicU64>,
    pub signature_failures: Arc<AtomicU64>,
    pub validation_failures: Arc<AtomicU64>,
    pub sanitized_fragments: Arc<AtomicU64>,
    pub keys_issued: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_allowed: Arc::new(AtomicU64::new(0)),
            requests_limited: Arc::new(AtomicU64::new(0)),
            csrf_failures: Arc::new(AtomicU64::new(0)),
            auth_failures: Arc::new(AtomicU64::new(0)),
            signature_failures: Arc::new(AtomicU64::new(0)),
            validation_failures: Arc::new(AtomicU64::new(0)),
            sanitized_fragments: Arc::new(AtomicU64::new(0)),
            keys_issued: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn inc_allowed(&self) {
        self.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_limited(&self) {
        self.requests_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_csrf_failures(&self) {
        self.csrf_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signature_failures(&self) {
        self.signature_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_validation_failures(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sanitized(&self, count: u64) {
        self.sanitized_fragments.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_keys_issued(&self) {
        self.keys_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_allowed: self.requests_allowed.load(Ordering::Relaxed),
            requests_limited: self.requests_limited.load(Ordering::Relaxed),
            csrf_failures: self.csrf_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            sanitized_fragments: self.sanitized_fragments.load(Ordering::Relaxed),
            keys_issued: self.keys_issued.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_limited: u64,
    pub csrf_failures: u64,
    pub auth_failures: u64,
    pub signature_failures: u64,
    pub validation_failures: u64,
    pub sanitized_fragments: u64,
    pub keys_issued: u64,
    pub uptime_seconds: u64,
}
