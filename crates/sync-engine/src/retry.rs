use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for failed chunk attempts: exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
    /// Spread delays by ±25% so concurrent chunks don't retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 250,
            max_delay_ms: 15_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if a chunk that has failed `failures` times may retry.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Un-jittered delay before retry `attempt` (1-based):
    /// `min(initial * factor^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64);
        Duration::from_secs_f64(capped.max(0.0) / 1000.0)
    }

    /// Delay before retry `attempt` (1-based), with ±25% jitter when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let secs = base.as_secs_f64();
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((secs + secs * 0.25 * offset).max(0.0))
    }
}
