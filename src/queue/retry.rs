use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for failed transport sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Random spread applied to each delay (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` failed sends, or None
    /// once retries are exhausted.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_retries {
            return None;
        }

        let exp = self.backoff_factor.powi(failures.saturating_sub(1) as i32);
        let capped = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        Some(Duration::from_millis((capped + jitter).max(0.0) as u64))
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}
