// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::trace;

/// Upper bound for the maximum delay.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with jitter.
///
/// Starts at an initial value and gets multiplied by a constant factor on every increment until
/// it hits a ceiling. Every delay handed out is randomly shifted by up to the jitter fraction.
#[derive(Debug)]
pub struct Backoff {
    value: Duration,
    config: Config,
    rng: ChaCha20Rng,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Backoff will always begin with this initial value.
    pub initial: Duration,

    /// Multiplier applied on every increment.
    pub factor: f64,

    /// Maximum relative deviation of a delay, `0.1` shifts delays by up to ±10%.
    pub jitter: f64,

    /// Maximum reachable backoff value.
    pub max: Duration,
}

impl Config {
    /// Poll interval: 2s doubling up to 30s.
    pub fn poll() -> Self {
        Self {
            initial: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Reconnect delay of the event stream: 1s doubling up to 30s.
    pub fn reconnect() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidJitter(self.jitter));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::InvalidFactor(self.factor));
        }
        if self.max > MAX_DELAY {
            return Err(ConfigError::MaxTooLarge(self.max));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("jitter must be between 0 and 1, got {0}")]
    InvalidJitter(f64),

    #[error("factor must be a finite number of at least 1, got {0}")]
    InvalidFactor(f64),

    #[error("maximum delay of {0:?} exceeds {MAX_DELAY:?}")]
    MaxTooLarge(Duration),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn new(config: Config, rng: ChaCha20Rng) -> Self {
        Self {
            value: config.initial.min(config.max),
            config,
            rng,
        }
    }

    /// Current delay without jitter.
    pub fn current(&self) -> Duration {
        self.value
    }

    /// Current delay with jitter applied, never above the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        // NaN fails the comparison and disables the jitter.
        let jitter = if self.config.jitter > 0.0 {
            self.config.jitter.min(1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || self.value.is_zero() {
            return self.value;
        }

        let shift = self.rng.random_range(-jitter..=jitter);
        Duration::try_from_secs_f64(self.value.as_secs_f64() * (1.0 + shift))
            .unwrap_or(self.config.max)
            .min(self.config.max)
    }

    pub fn increment(&mut self) {
        let factor = self.config.factor.max(1.0);
        self.value = Duration::try_from_secs_f64(self.value.as_secs_f64() * factor)
            .unwrap_or(self.config.max)
            .min(self.config.max);
    }

    pub fn reset(&mut self) {
        self.value = self.config.initial.min(self.config.max);
    }

    pub async fn sleep(&mut self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            return;
        }

        trace!("backoff {} ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}
