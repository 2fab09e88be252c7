// Exponential backoff for failed webhook deliveries
//
// Implements retry strategy with:
// - Exponential backoff (1s, 2s, 4s, 8s, ...)
// - A cap on any single delay
// - Jitter to prevent thundering herd
// - A bounded number of attempts per delivery

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Retry policy configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before a delivery is marked failed (default 5)
    pub max_attempts: u32,
    /// Base delay in milliseconds (default 1000ms)
    pub base_delay_ms: u64,
    /// Maximum single delay in milliseconds (default 300000ms)
    pub max_delay_ms: u64,
    /// Add ±20% jitter to delay (default true)
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            use_jitter: true,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after this delay
    Retry(Duration),
    /// Attempts exhausted
    GiveUp,
}

impl RetryPolicy {
    /// Decide what happens after `attempts` failed attempts
    ///
    /// Formula with exponential backoff and optional jitter:
    /// delay = min(base * 2^(attempts - 1), max_delay) ± 20%
    pub fn next(&self, attempts: u32) -> RetryDecision {
        if attempts >= self.max_attempts {
            debug!("Max attempts ({}) reached, giving up", self.max_attempts);
            return RetryDecision::GiveUp;
        }

        let exponent = attempts.saturating_sub(1).min(32);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(self.max_delay_ms);

        let delay_ms = if self.use_jitter && delay_ms > 0 {
            let jitter = (delay_ms as f64 * 0.2) as u64;
            let mut rng = rand::rng();
            let random_jitter = rng.random_range(0..=jitter);
            if rng.random_bool(0.5) {
                delay_ms.saturating_add(random_jitter)
            } else {
                delay_ms.saturating_sub(random_jitter)
            }
        } else {
            delay_ms
        };

        debug!(
            "Retry after attempt {} - delay {} ms (cap: {} ms)",
            attempts, delay_ms, self.max_delay_ms
        );

        RetryDecision::Retry(Duration::from_millis(delay_ms))
    }
}
