//! Exponential backoff with jitter for resubscription

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised either way
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl From<&ReconnectConfig> for BackoffConfig {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; grows until `max`
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.current.min(self.config.max);
        self.attempts += 1;
        self.current = self.scaled(base, self.config.multiplier);

        if self.config.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = self.config.jitter;
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        self.scaled(base, factor)
    }

    /// `delay * factor`, capped at `max` even when the product overflows
    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(self.config.max, |scaled| scaled.min(self.config.max))
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
