//! Exponential backoff for transient provider failures.

use std::time::Duration;

use toolweave_config::AgentSettings;
use toolweave_core::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// `initial * 2^attempt`, capped at `max_backoff`. `attempt` is zero-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// How long to wait before retrying after `error`, or `None` when the
    /// error is permanent or the retries are used up.
    pub fn delay_for(&self, error: &ProviderError, attempt: u32) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_retries {
            return None;
        }
        let delay = self.backoff(attempt);
        Some(match error {
            ProviderError::RateLimited { retry_after_secs } => delay.max(Duration::from_secs(*retry_after_secs)),
            _ => delay,
        })
    }
}
