use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Bounded, capped exponential back-off for reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Backoff { config, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.config.enabled || self.attempt >= self.config.attempts {
            return None;
        }
        let base = self.base_delay(self.attempt);
        self.attempt += 1;
        Some(self.jitter(base))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .delay
            .saturating_mul(factor)
            .min(self.config.delay_max)
    }

    fn jitter(&self, base: Duration) -> Duration {
        let spread = self.config.randomization.clamp(0.0, 1.0);
        if spread == 0.0 {
            return base;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        base.mul_f64(1.0 + offset).min(self.config.delay_max)
    }
}
