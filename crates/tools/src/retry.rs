//! Jittered exponential backoff for transient tool failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tunable parameters for retrying a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts.
    pub max_delay_ms: u64,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Un-jittered delay before retry number `retry` (1-based), clamped to
    /// the maximum.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let mut delay = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        for _ in 1..retry {
            delay = next_delay(delay, self.multiplier, max);
        }
        delay.min(max)
    }

    /// Delay before retry number `retry`, drawn from `[base / 2, base]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(base / 2..=base);
        Duration::from_millis(jittered)
    }
}

/// Calculate the next backoff delay from the current delay, clamped to `max`.
pub fn next_delay(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next_ms = (current.as_millis() as f64 * multiplier) as u64;
    Duration::from_millis(next_ms).min(max)
}
