use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::shared::ValidationError;

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after every failed attempt.
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::RetryMaxAttemptsZero);
        }

        if self.backoff_factor < 1.0 {
            return Err(ValidationError::RetryBackoffFactorTooSmall);
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::RetryDelaysInverted);
        }

        Ok(())
    }

    /// Delay to wait before attempt number `attempt + 1`, where `attempt` starts at 1.
    ///
    /// Jitter is not included.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);

        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
        }
    }
}
