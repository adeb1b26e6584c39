//! Exponential backoff schedule for reconnection attempts.

use std::time::Duration;

/// Backoff schedule: `initial_delay * backoff_factor^(attempt-1)`,
/// capped at `max_delay`, for at most `max_attempts` attempts.
///
/// Deliberately deterministic (no jitter): exactly two peers are ever
/// involved, so synchronized retries are harmless and predictable delays
/// make the recovery window easy to reason about.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier applied for each subsequent attempt.
    pub backoff_factor: u32,
    /// Attempts before automatic recovery gives up.
    pub max_attempts: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2,
            max_attempts: 5,
        }
    }
}

impl RetrySchedule {
    /// Delay before the given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let factor = u64::from(self.backoff_factor).saturating_pow(exp);
        self.initial_delay
            .saturating_mul(factor.min(u64::from(u32::MAX)) as u32)
            .min(self.max_delay)
    }

    /// Whether the given attempt (1-based) is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
