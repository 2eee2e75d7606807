//! Exponential reconnect backoff.

use std::time::Duration;

/// Delay schedule for automatic retries.
///
/// The delay before retry `n` (1-based) is `min(base * 2^n, cap)`, computed
/// with saturating arithmetic. After `max_attempts` retries have failed the
/// caller gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base delay.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Number of automatic retries before giving up.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap)
    }

    /// Whether another retry is allowed after `attempts` retries so far.
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000), 5)
    }
}
