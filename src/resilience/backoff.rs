//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff settings for reconnects and publish retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound for a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self { base_delay_ms, max_delay_ms }
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    ///
    /// Doubles from `base_delay_ms` up to `max_delay_ms`, plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.max(1) - 1;
        let capped = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(doublings))
            .min(self.max_delay_ms);

        let spread = capped / 10;
        let jitter = if spread > 0 { rand::thread_rng().gen_range(0..spread) } else { 0 };
        Duration::from_millis(capped + jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 30_000,
        }
    }
}
