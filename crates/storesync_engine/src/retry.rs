//! Retry scheduling with exponential backoff.

use chrono::{DateTime, Utc};
use std::time::Duration;
use storesync_protocol::SyncConfiguration;

/// Backoff settings for queue items of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

/// What happens to an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Back to `pending`, eligible again at the given time.
    RetryAt(DateTime<Utc>),
    /// Attempt ceiling reached.
    Exhausted,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Reads the policy from a store's configuration.
    pub fn from_config(config: &SyncConfiguration) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_secs(config.retry_delay_secs),
            Duration::from_secs(config.max_retry_delay_secs),
        )
    }

    /// Delay after the `attempts`-th failure (1-indexed).
    ///
    /// `initial_delay * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Decides the next step for an item that has now failed `attempts` times.
    pub fn next_step(&self, attempts: u32, now: DateTime<Utc>) -> RetryStep {
        if attempts >= self.max_attempts {
            return RetryStep::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        RetryStep::RetryAt(now + delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30), Duration::from_secs(3600))
    }
}
