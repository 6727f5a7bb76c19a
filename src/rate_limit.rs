//! Fixed-window request counting per identifier.
//!
//! `check` is a pure read and `increment` is the only mutator, so a request
//! handler checks first, does its work, then records the outcome. A block
//! (`backoff_until` in the future) overrides window accounting entirely.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
    backoff_until: Option<Instant>,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        Self { count: 0, window_start: now, backoff_until: None }
    }

    fn backoff_active(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }
}

/// Outcome of a rate-limit lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the current window (or block) ends.
    pub reset_time: DateTime<Utc>,
    /// Set only when `allowed` is false.
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// `retry_after` rounded up to whole seconds, as used by the `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_millis().div_ceil(1000) as u64)
    }
}

/// An in-memory fixed-window rate limiter keyed by client identifier.
///
/// Cloning is cheap; clones share the same store and sweeper.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    entries: Arc<DashMap<String, RateLimitEntry>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RateLimiter {
    /// Creates a limiter and, when called inside a tokio runtime, starts the
    /// periodic sweep (every `window_ms`).
    pub fn new(config: RateLimitConfig) -> Self {
        let limiter = Self {
            window: Duration::from_millis(config.window_ms.max(1)),
            config,
            entries: Arc::new(DashMap::new()),
            sweeper: Arc::new(Mutex::new(None)),
        };
        limiter.start_sweeper();
        limiter
    }

    /// Reports whether `id` may make a request now. Never mutates state.
    pub fn check(&self, id: &str) -> RateLimitInfo {
        let now = Instant::now();
        if !self.config.enabled {
            return self.fresh_info(now);
        }
        match self.entries.get(id) {
            Some(entry) => self.evaluate(&entry, now),
            None => self.fresh_info(now),
        }
    }

    /// Records one request for `id`, unless the skip policy excludes it.
    ///
    /// Returns the state after recording.
    pub fn increment(&self, id: &str, success: bool) -> RateLimitInfo {
        if !self.config.enabled {
            return self.fresh_info(Instant::now());
        }
        if (success && self.config.skip_successful_requests) || (!success && self.config.skip_failed_requests) {
            tracing::debug!(identifier = id, success, "Skipping rate limit increment by policy");
            return self.check(id);
        }

        let now = Instant::now();
        let mut entry = self.entries.entry(id.to_string()).or_insert_with(|| RateLimitEntry::new(now));
        if entry.backoff_active(now) {
            return self.evaluate(&entry, now);
        }

        if now.saturating_duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count = entry.count.saturating_add(1);
        if entry.count > self.config.max_requests {
            tracing::warn!(identifier = id, count = entry.count, "Rate limit exceeded");
        }
        self.evaluate(&entry, now)
    }

    /// Forces `id` to be rejected for `duration`, regardless of its window.
    pub fn block(&self, id: &str, duration: Duration) {
        let now = Instant::now();
        let mut entry = self.entries.entry(id.to_string()).or_insert_with(|| RateLimitEntry::new(now));
        entry.backoff_until = Some(now + duration);
        tracing::warn!(identifier = id, duration_ms = duration.as_millis() as u64, "Identifier blocked");
    }

    /// Forgets everything known about `id`, including any block.
    pub fn reset(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Number of identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes entries whose window is older than twice `window_ms` and whose block has expired.
    pub fn sweep(&self) -> usize {
        sweep_entries(&self.entries, self.window)
    }

    /// Stops the background sweep and drops all entries.
    pub fn destroy(&self) {
        let task = match self.sweeper.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        self.entries.clear();
        tracing::debug!("Rate limiter destroyed");
    }

    fn start_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime available; rate limit sweep must be driven manually");
            return;
        };
        let entries: Weak<DashMap<String, RateLimitEntry>> = Arc::downgrade(&self.entries);
        let period = self.window;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(entries) = entries.upgrade() else { break };
                let removed = sweep_entries(&entries, period);
                if removed > 0 {
                    tracing::debug!(removed, remaining = entries.len(), "Swept stale rate limit entries");
                }
            }
        });
        match self.sweeper.lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(poisoned) => *poisoned.into_inner() = Some(task),
        }
    }

    fn evaluate(&self, entry: &RateLimitEntry, now: Instant) -> RateLimitInfo {
        let max = self.config.max_requests;
        if let Some(until) = entry.backoff_until.filter(|until| *until > now) {
            return RateLimitInfo {
                allowed: false,
                limit: max,
                remaining: 0,
                reset_time: instant_to_utc(now, until),
                retry_after: Some(until - now),
            };
        }

        let window_end = entry.window_start + self.window;
        if now >= window_end {
            return self.fresh_info(now);
        }

        let allowed = entry.count < max;
        RateLimitInfo {
            allowed,
            limit: max,
            remaining: max.saturating_sub(entry.count),
            reset_time: instant_to_utc(now, window_end),
            retry_after: if allowed { None } else { Some(window_end - now) },
        }
    }

    fn fresh_info(&self, now: Instant) -> RateLimitInfo {
        RateLimitInfo {
            allowed: true,
            limit: self.config.max_requests,
            remaining: self.config.max_requests,
            reset_time: instant_to_utc(now, now + self.window),
            retry_after: None,
        }
    }
}

fn sweep_entries(entries: &DashMap<String, RateLimitEntry>, window: Duration) -> usize {
    let now = Instant::now();
    let horizon = window * 2;
    let before = entries.len();
    entries.retain(|_, entry| {
        let window_stale = now.saturating_duration_since(entry.window_start) > horizon;
        !(window_stale && !entry.backoff_active(now))
    });
    before.saturating_sub(entries.len())
}

fn instant_to_utc(now: Instant, at: Instant) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(at.saturating_duration_since(now))
        .unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window_ms: u64, max_requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window_ms,
            max_requests,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    #[test]
    fn test_limit_reached_after_max_increments() {
        let limiter = RateLimiter::new(config(1000, 5));
        for _ in 0..5 {
            assert!(limiter.check("client").allowed);
            limiter.increment("client", true);
        }
        let info = limiter.check("client");
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);
        assert!(info.retry_after.is_some_and(|d| d > Duration::ZERO));
        assert_eq!(info.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_request_reaching_max_is_allowed() {
        let limiter = RateLimiter::new(config(1000, 3));
        limiter.increment("c", true);
        limiter.increment("c", true);
        let info = limiter.check("c");
        assert!(info.allowed);
        assert_eq!(info.remaining, 1);
    }

    #[test]
    fn test_check_does_not_mutate() {
        let limiter = RateLimiter::new(config(1000, 2));
        for _ in 0..10 {
            assert_eq!(limiter.check("c").remaining, 2);
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_window_expiry_restores_budget() {
        let limiter = RateLimiter::new(config(100, 2));
        limiter.increment("c", true);
        limiter.increment("c", true);
        assert!(!limiter.check("c").allowed);

        std::thread::sleep(Duration::from_millis(150));
        let info = limiter.check("c");
        assert!(info.allowed);
        assert_eq!(info.remaining, 2);

        // The next increment starts a fresh window
        let info = limiter.increment("c", true);
        assert_eq!(info.remaining, 1);
    }

    #[test]
    fn test_different_identifiers_are_independent() {
        let limiter = RateLimiter::new(config(1000, 1));
        limiter.increment("a", true);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn test_block_overrides_window() {
        let limiter = RateLimiter::new(config(50, 100));
        limiter.block("c", Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(80));
        let info = limiter.check("c");
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);

        // Increments during a block are not counted
        limiter.increment("c", true);
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.check("c").allowed);
    }

    #[test]
    fn test_expired_block_falls_back_to_window_count() {
        let limiter = RateLimiter::new(config(5_000, 5));
        limiter.increment("c", true);
        limiter.block("c", Duration::from_millis(30));
        assert!(!limiter.check("c").allowed);

        std::thread::sleep(Duration::from_millis(60));
        let info = limiter.check("c");
        assert!(info.allowed);
        assert_eq!(info.remaining, 4);
        assert!(info.retry_after.is_none());
    }

    #[test]
    fn test_skip_policies() {
        let mut cfg = config(1000, 1);
        cfg.skip_successful_requests = true;
        let limiter = RateLimiter::new(cfg);
        limiter.increment("c", true);
        limiter.increment("c", true);
        assert!(limiter.check("c").allowed);
        limiter.increment("c", false);
        assert!(!limiter.check("c").allowed);
    }

    #[test]
    fn test_disabled_always_allows() {
        let mut cfg = config(1000, 1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(cfg);
        for _ in 0..5 {
            limiter.increment("c", true);
        }
        assert!(limiter.check("c").allowed);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_sweep_keeps_active_blocks() {
        let limiter = RateLimiter::new(config(20, 5));
        limiter.increment("stale", true);
        limiter.block("blocked", Duration::from_secs(10));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);
        assert!(!limiter.check("blocked").allowed);
    }

    #[test]
    fn test_reset_clears_identifier() {
        let limiter = RateLimiter::new(config(1000, 1));
        limiter.increment("c", true);
        limiter.block("c", Duration::from_secs(60));
        limiter.reset("c");
        assert!(limiter.check("c").allowed);
    }

    #[tokio::test]
    async fn test_background_sweep_and_destroy() {
        let limiter = RateLimiter::new(config(20, 5));
        limiter.increment("c", true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.is_empty());

        limiter.increment("d", true);
        limiter.destroy();
        assert!(limiter.is_empty());
        assert!(limiter.sweeper.lock().unwrap().is_none());
    }
}
