//! Exponential backoff between retries of a transfer.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `retry_count`-th retry: `initial × multiplier^(retry_count-1)`,
    /// capped at the configured maximum.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
