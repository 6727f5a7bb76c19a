//! Per-identifier exponential backoff with symmetric jitter.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use crate::config::BackoffConfig;

/// Tracks consecutive failures per identifier and turns them into delays.
///
/// The delay for `n` recorded failures is `min(base * factor^n, max)`, spread
/// by up to `jitter * delay` in either direction.
#[derive(Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempts: Arc<DashMap<String, u32>>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempts: Arc::new(DashMap::new()) }
    }

    /// Delay that should precede the next attempt by `id`.
    pub fn get_delay(&self, id: &str) -> Duration {
        self.delay_for(self.attempts(id))
    }

    /// Records a failure and returns the delay for the next attempt.
    pub fn record_failure(&self, id: &str) -> Duration {
        let attempts = {
            let mut entry = self.attempts.entry(id.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let delay = self.delay_for(attempts);
        tracing::debug!(identifier = id, attempts, delay_ms = delay.as_millis() as u64, "Recorded failure");
        delay
    }

    /// Clears the failure count for `id`.
    pub fn record_success(&self, id: &str) {
        self.attempts.remove(id);
    }

    pub fn reset(&self, id: &str) {
        self.attempts.remove(id);
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts.get(id).map(|a| *a).unwrap_or(0)
    }

    fn delay_for(&self, attempts: u32) -> Duration {
        // Beyond this the product saturates to max_delay anyway
        let exponent = attempts.min(64) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.factor.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64);

        let span = capped * self.config.jitter;
        let jitter = if span > 0.0 {
            rand::thread_rng().gen_range(-span..=span)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0).round() as u64)
    }
}
