//! Linear retry schedules.

use std::time::Duration;

/// Linear backoff: attempt `n` (0-indexed) waits `base * (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
}

impl LinearBackoff {
    pub const fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }

    /// Delay to wait after failed attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.saturating_add(1))
    }

    /// Whether a retry may follow failed attempt `attempt`.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}
