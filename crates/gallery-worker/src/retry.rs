//! Retry policy and backoff schedule.

use std::time::Duration;

use gallery_core::config::queue::QueueSettings;

/// Per-queue retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total execution attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Build a policy from resolved queue settings.
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.retry_base_delay_ms),
            Duration::from_millis(settings.retry_max_delay_ms),
        )
    }

    /// Delay before the next attempt after `attempts` failed attempts.
    ///
    /// `base * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}
