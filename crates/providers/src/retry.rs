//! Exponential backoff with jitter.
//!
//! Jitter scheme: the nominal exponential delay is scaled by a uniform
//! factor in [0.75, 1.25]. Only the exponential base and the cap are
//! load-bearing; the factor range just spreads retries from concurrent runs
//! apart.

use rand::Rng;
use std::time::Duration;
use windlass_config::RetryConfig;

/// Backoff policy for transient model failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }

    /// The jittered delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let nominal = self.initial_backoff.as_secs_f64()
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = nominal.min(self.max_backoff.as_secs_f64());

        let jitter_factor = rand::rng().random_range(0.75..1.25);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}
