use std::time;

/// The retry policy used to determine how far into the future a queue job is
/// rescheduled after a transient failure.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the backoff before the next retry of a job on its given attempt.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_attempts() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None);

        assert_eq!(policy.retry_interval(0), time::Duration::from_secs(1));
        assert_eq!(policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(policy.retry_interval(4), time::Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_is_capped_by_maximum_interval() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(5)),
        );

        assert_eq!(policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(policy.retry_interval(10), time::Duration::from_secs(5));
    }
}
