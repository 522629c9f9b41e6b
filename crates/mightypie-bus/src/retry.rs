//! Delay policy for the initial connect loop.

use std::time::Duration;

use mightypie_settings::{BackoffKind, RetrySettings};

/// How many times to try connecting, and how long to wait in between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of connect attempts (at least 1).
    pub max_retries: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Fixed or exponential growth of the delay.
    pub backoff: BackoffKind,
    /// Upper bound for exponential delays.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delay,
            backoff: BackoffKind::Fixed,
            max_delay: delay,
        }
    }

    /// Exponential delay starting at `delay`, capped at `max_delay`.
    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delay,
            backoff: BackoffKind::Exponential,
            max_delay: max_delay.max(delay),
        }
    }

    /// Build from the `retry` settings section.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            delay: Duration::from_millis(settings.delay_ms),
            backoff: settings.backoff,
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.delay_ms)),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => Duration::from_millis(calculate_backoff_delay(
                attempt.saturating_sub(1),
                self.delay.as_millis() as u64,
                self.max_delay.as_millis() as u64,
            )),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Exponential backoff: `min(max_delay, base_delay * 2^attempt)`.
///
/// `attempt` is zero-based (0 for the first retry).
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}
