//! Exponential retry delays with symmetric jitter

use crate::config::BackoffConfig;
use std::time::Duration;

/// Capped exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_ratio,
        )
    }

    /// `base * 2^(attempt - 1)`, capped at the maximum
    ///
    /// Attempts start at 1; attempt 0 is treated as 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// The base delay scaled by a uniform factor in `1 +/- jitter_ratio`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter_ratio == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::random_range(-self.jitter_ratio..=self.jitter_ratio);
        delay.mul_f64(factor)
    }

    /// Largest value `jittered_delay` can return
    pub fn max_delay_bound(&self) -> Duration {
        self.max.mul_f64(1.0 + self.jitter_ratio)
    }
}

/// Uniform duration in `[min_ms, max_ms]` milliseconds
pub fn uniform_ms(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::random_range(min_ms..=max_ms))
}
