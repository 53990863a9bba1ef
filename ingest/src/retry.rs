//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure batch write retries.
use std::time;

/// Wall-clock budget of a whole ingest call when none is configured.
pub const DEFAULT_DEADLINE: time::Duration = time::Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy to determine backoff and deadline of batch writes.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Maximum wall-clock time spent on a batch, retries included.
    pub deadline: time::Duration,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the backoff to wait after a given failed attempt number, starting at 1.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let coefficient = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate_interval = self
            .initial_interval
            .checked_mul(coefficient)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub deadline: time::Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: Some(time::Duration::from_secs(5)),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn deadline(mut self, deadline: time::Duration) -> RetryPolicyBuilder {
        self.deadline = deadline;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            deadline: self.deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(40), time::Duration::from_secs(4));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_retry_interval_saturates_without_maximum() {
        let retry_policy = RetryPolicy::build(10, time::Duration::from_secs(1)).provide();

        assert_eq!(
            retry_policy.retry_interval(64),
            time::Duration::from_secs(u64::from(u32::MAX))
        );
    }

    #[test]
    fn test_default_policy() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.deadline, DEFAULT_DEADLINE);
        assert_eq!(
            retry_policy.retry_interval(1),
            time::Duration::from_millis(200)
        );
        assert_eq!(retry_policy.retry_interval(10), time::Duration::from_secs(5));
    }
}
