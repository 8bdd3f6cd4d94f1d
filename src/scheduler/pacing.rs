//! Pre-request delays that keep each identity's traffic irregular

use crate::config::PacingConfig;
use crate::scheduler::backoff::uniform_ms;
use std::time::Duration;

/// Computes the delay inserted before each request
#[derive(Debug, Clone)]
pub struct Pacing {
    config: PacingConfig,
}

impl Pacing {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    /// Delay before the `request_count`-th request of an identity
    ///
    /// A uniform interval plus uniform jitter. Every `long-pause-every`
    /// requests a long pause is added on top.
    pub fn delay_before(&self, request_count: u64) -> Duration {
        let mut delay = uniform_ms(self.config.min_interval_ms, self.config.max_interval_ms)
            + uniform_ms(0, self.config.jitter_ms);

        if self.is_long_pause(request_count) {
            let pause = uniform_ms(
                self.config.long_pause_min_secs * 1000,
                self.config.long_pause_max_secs * 1000,
            );
            tracing::info!(
                "Taking a long pause of {:.0}s after {} requests",
                pause.as_secs_f64(),
                request_count
            );
            delay += pause;
        }

        delay
    }

    fn is_long_pause(&self, request_count: u64) -> bool {
        let every = self.config.long_pause_every;
        every > 0 && request_count > 0 && request_count % every == 0
    }
}
