//! Retry policy: decides backoff delays after storage failures.

use std::time::Duration;

/// Exponential backoff used by the worker loop when the store is unavailable.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for the next retry based on the number of consecutive failures.
    ///
    /// delay = base_delay * multiplier^(failures - 1), capped at `max_delay`.
    ///
    /// Example with base_delay=500ms, multiplier=2.0:
    /// - failure 1: 500ms
    /// - failure 2: 1s
    /// - failure 3: 2s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
