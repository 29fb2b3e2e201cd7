//! Lease backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff applied to every lease granted by a poll.
///
/// `delay(attempts) = min(max_delay, base ^ attempts)` seconds, evaluated on
/// the attempt count *after* the lease increments it. The poll's `ttr` is added
/// on top of this delay by the caller, so the exponential part only widens the
/// visibility window of tickets that keep coming back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Exponential base, in seconds. Must be finite and `>= 1.0`.
    pub base: f64,
    /// Ceiling of the exponential component (independent of `ttr`).
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const DEFAULT_BASE: f64 = 1.5;
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);

    pub fn new(base: f64, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// A policy that adds no backoff at all (lease = `ttr`).
    pub fn none() -> Self {
        Self {
            base: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Check that the policy can be evaluated (and pushed down to SQL).
    pub fn is_valid(&self) -> bool {
        self.base.is_finite() && self.base >= 1.0
    }

    /// Exponential component for a given (post-increment) attempt count.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exp = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.base.powi(exp);
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Full lease length: capped backoff plus the time-to-run window.
    pub fn lease_for_attempt(&self, attempts: u32, ttr: Duration) -> Duration {
        self.delay_for_attempt(attempts).saturating_add(ttr)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Self::DEFAULT_BASE,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_matches_reference_values() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, 1.5);
        assert_eq!(policy.max_delay, Duration::from_secs(15));
    }

    #[test]
    fn exponential_delay_grows_with_attempts() {
        let policy = BackoffPolicy::new(2.0, Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();

        // 1.5^7 ≈ 17s > 15s
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(15));
    }

    #[test]
    fn lease_adds_ttr() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.lease_for_attempt(1, Duration::from_secs(5)),
            Duration::from_millis(6500)
        );
    }

    #[test]
    fn none_policy_is_just_ttr() {
        let policy = BackoffPolicy::none();
        assert_eq!(
            policy.lease_for_attempt(10, Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn validity() {
        assert!(BackoffPolicy::default().is_valid());
        assert!(!BackoffPolicy::new(0.5, Duration::from_secs(1)).is_valid());
        assert!(!BackoffPolicy::new(f64::NAN, Duration::from_secs(1)).is_valid());
        assert!(!BackoffPolicy::new(f64::INFINITY, Duration::from_secs(1)).is_valid());
    }

    proptest! {
        /// Property: the exponential component never decreases and never exceeds the cap.
        #[test]
        fn delay_is_monotonic_and_bounded(
            base in 1.0f64..4.0,
            cap_ms in 0u64..120_000,
            attempts in 0u32..200,
        ) {
            let policy = BackoffPolicy::new(base, Duration::from_millis(cap_ms));
            let now = policy.delay_for_attempt(attempts);
            let next = policy.delay_for_attempt(attempts + 1);

            prop_assert!(now <= policy.max_delay);
            prop_assert!(next >= now);
        }
    }
}
