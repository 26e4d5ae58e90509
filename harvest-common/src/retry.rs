use std::time;

/// The retry policy used to determine how long to wait before a task
/// becomes visible again after a nack.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply `initial_interval` with for every past attempt.
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

    /// Calculate the time until the next retry for a given attempt number.
    /// `attempt` is the 0-based attempt that just failed.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

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
            maximum_interval: Some(time::Duration::from_secs(300)),
        }
    }
}
