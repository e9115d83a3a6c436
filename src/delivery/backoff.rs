//! The retry policy shared by every delivery.

use std::time::Duration;

use crate::config::DeliveryConfig;

/// Bounded exponential backoff.
///
/// `max_attempts` counts every attempt including the first.  After the
/// `n`-th failed attempt the next one is scheduled
/// `base × 2^(n-1)` later, never more than `cap`.
///
/// ```
/// use std::time::Duration;
/// use potion_monitor::delivery::BackoffPolicy;
///
/// let policy = BackoffPolicy::new(4, Duration::from_millis(100), Duration::from_millis(250));
/// assert_eq!(policy.delay_after(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_after(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_after(3), Duration::from_millis(250));
/// assert!(policy.should_retry(3));
/// assert!(!policy.should_retry(4));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.max_retries, config.base_backoff(), config.max_backoff())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait after the `attempts_made`-th failed attempt.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}
