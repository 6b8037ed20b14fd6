//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue with the attempt count set to `next_attempt`
    Retry { next_attempt: u32, delay: Duration },

    /// No attempts left; the job is terminally failed
    Exhausted,
}

/// Configuration for job retries
///
/// `attempt_count` counts failed attempts so far, so a job with
/// `max_attempts = 3` runs at most three times: it is retried while
/// `attempt_count + 1 < max_attempts`.
///
/// # Example
///
/// ```
/// use loadpool::{RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_millis(500), 3);
///
/// assert!(matches!(policy.decide(0), RetryDecision::Retry { next_attempt: 1, .. }));
/// assert!(matches!(policy.decide(1), RetryDecision::Retry { next_attempt: 2, .. }));
/// assert_eq!(policy.decide(2), RetryDecision::Exhausted);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of executions (including the first)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "crate::duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy
    ///
    /// - 3 max attempts
    /// - 1 second initial interval
    /// - 30 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// Create a policy that retries right away
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(Duration::ZERO, max_attempts)
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Decide what happens after an attempt fails
    ///
    /// `attempt_count` is the number of failed attempts before this one.
    pub fn decide(&self, attempt_count: u32) -> RetryDecision {
        if !self.has_attempts_remaining(attempt_count) {
            return RetryDecision::Exhausted;
        }
        let next_attempt = attempt_count + 1;
        RetryDecision::Retry {
            next_attempt,
            delay: self.delay_for_retry(next_attempt),
        }
    }

    /// Check if another attempt is allowed after `attempt_count` failures
    pub fn has_attempts_remaining(&self, attempt_count: u32) -> bool {
        attempt_count.saturating_add(1) < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        // Apply jitter
        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.decide(0), RetryDecision::Exhausted);
    }

    #[test]
    fn test_three_attempts_then_exhausted() {
        let policy = RetryPolicy::immediate(3);

        assert_eq!(
            policy.decide(0),
            RetryDecision::Retry {
                next_attempt: 1,
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::ZERO
            }
        );
        assert_eq!(policy.decide(2), RetryDecision::Exhausted);
        assert_eq!(policy.decide(3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 4);

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_retry() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_jitter(0.0); // Disable jitter for predictable tests

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);

        for _ in 0..50 {
            let delay = policy.delay_for_retry(2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
