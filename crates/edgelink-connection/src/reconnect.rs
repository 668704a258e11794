//! Reconnection delays with capped exponential backoff

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(with = "crate::duration_secs")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "crate::duration_secs")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err("initial_backoff must be greater than zero".to_string());
        }
        if self.max_backoff < self.initial_backoff {
            return Err("max_backoff must not be smaller than initial_backoff".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }
}

/// Backoff state for one reconnecting endpoint.
///
/// Retries never give up; the delay grows from `initial_backoff` by
/// `multiplier` per failed attempt and stays at `max_backoff`.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay to use for the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current_backoff;

        let next_backoff =
            Duration::try_from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier)
                .unwrap_or(self.config.max_backoff);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        delay
    }

    /// Wait before the next attempt.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        debug!(
            "Waiting {:?} before reconnection attempt {}",
            delay, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
