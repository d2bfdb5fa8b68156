//! Retry policy with exponential backoff.
//!
//! Governs how many times the failover client re-tries the *current*
//! broker before rotating to the next address. Backoff grows
//! exponentially from `retry_interval` up to `max_backoff`; jitter
//! spreads simultaneous retries after a broker failure.

use std::time::Duration;

/// Per-broker retry budget and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts against one broker before rotating (in addition to the
    /// first try).
    pub max_retries: usize,

    /// Base backoff between attempts.
    pub retry_interval: Duration,

    /// Backoff ceiling.
    pub max_backoff: Duration,

    /// Exponential growth factor.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (0-indexed):
    /// `min(retry_interval * multiplier^attempt, max_backoff)`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let ms = self.retry_interval.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }

    /// Backoff with ±25% jitter to avoid thundering-herd reconnects.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + (rand::random::<f64>() * 0.5);
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }
}
