//! Retry policy and backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::WebhookError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Exponents above this saturate; `60s * 2^31` is already millennia.
const MAX_EXPONENT: u32 = 31;

/// Retry policy configuration.
///
/// `delay(attempt) = base_delay * 2^(attempt - 1)`, optionally capped by
/// `max_delay` and spread by `jitter`. With no cap and zero jitter (the
/// defaults) the schedule is exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per delivery, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Optional cap on a single delay.
    pub max_delay: Option<Duration>,
    /// Jitter factor (0.0-1.0); the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: None,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff without cap or jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), WebhookError> {
        if self.max_attempts == 0 {
            return Err(WebhookError::validation("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(WebhookError::validation("base_delay must be positive"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(WebhookError::validation("jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Delay after the given failed attempt (1-indexed), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = (attempt - 1).min(MAX_EXPONENT);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Delay after the given failed attempt with jitter applied.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let jitter = self.jitter.min(1.0);
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        let jittered = Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay);

        match self.max_delay {
            Some(cap) => jittered.min(cap),
            None => jittered,
        }
    }

    /// When the next attempt becomes due, counted from the completion of
    /// the failed `attempt`.
    pub fn next_retry_at(&self, attempt: u32, completed_at: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.jittered_delay(attempt, &mut rand::thread_rng());
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| completed_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn default_schedule_doubles_from_one_minute() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(480));
    }

    #[test]
    fn cap_limits_delay() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(200));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(200));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(3600));
        let at = Utc::now();
        assert!(policy.next_retry_at(u32::MAX - 1, at) > at);
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default().with_jitter(0.25);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = policy.jittered_delay(1, &mut rng).as_secs_f64();
            assert!((45.0..=75.0).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::exponential(0, Duration::from_secs(1)).validate().is_err());
        assert!(RetryPolicy::exponential(3, Duration::ZERO).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
    }

    proptest! {
        #[test]
        fn next_retry_is_exact_without_jitter(
            base_secs in 1u64..3600,
            attempt in 1u32..12,
            offset in 0i64..1_000_000,
        ) {
            let policy = RetryPolicy::exponential(20, Duration::from_secs(base_secs));
            let completed = Utc.timestamp_opt(offset, 0).unwrap();
            let next = policy.next_retry_at(attempt, completed);
            let expected = base_secs as i64 * 2i64.pow(attempt - 1);
            prop_assert_eq!((next - completed).num_seconds(), expected);
        }
    }
}
