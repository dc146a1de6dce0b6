//! Retry policy: exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Backoff and attempt accounting for stage jobs
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempt budget; a job that fails `max_retries` times dead-letters
    pub max_retries: u32,
    /// Base delay before the first retry (milliseconds)
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
        }
    }

    /// Whether a job with this many failed attempts gets another try
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_retries
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let nominal = self.backoff_ms.saturating_mul(1u64 << exponent);
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((nominal as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
        }
    }
}
