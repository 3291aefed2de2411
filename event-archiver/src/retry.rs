//! # Retry
//!
//! Module providing a `RetryPolicy` struct to wrap fallible store calls
//! with bounded exponential backoff.
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// The backoff interval after the first failed attempt.
    pub initial_interval: Duration,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Duration,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            maximum_interval: Duration::from_secs(10),
            backoff_coefficient: 2,
        }
    }
}

impl RetryPolicy {
    /// Determine the backoff interval after a failed attempt number (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(self.maximum_interval);
        std::cmp::min(candidate, self.maximum_interval)
    }

    /// Run `operation` until it succeeds or `max_attempts` is exhausted,
    /// sleeping the backoff interval between attempts. An explicit loop, so
    /// the call stack stays flat no matter how many attempts are configured.
    /// The final attempt's error is returned unchanged.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts => return Err(error),
                Err(error) => {
                    let delay = self.retry_interval(attempt);
                    warn!(
                        "attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, self.max_attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy {
            backoff_coefficient: 1,
            initial_interval: Duration::from_secs(2),
            ..Default::default()
        };

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(2),
            maximum_interval: Duration::from_secs(100),
            ..Default::default()
        };

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(8));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(2),
            maximum_interval: Duration::from_secs(4),
            ..Default::default()
        };

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(4), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_succeeds_after_n_failures() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_millis(1),
            maximum_interval: Duration::from_millis(2),
            backoff_coefficient: 2,
        };

        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt <= 2 {
                        Err("transient")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_the_last_error_unchanged() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            maximum_interval: Duration::from_millis(2),
            backoff_coefficient: 2,
        };

        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("boom {attempt}")) }
            })
            .await;

        assert_eq!(result, Err("boom 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_interval: Duration::from_secs(3600),
            maximum_interval: Duration::from_secs(3600),
            backoff_coefficient: 2,
        };

        let result: Result<(), &str> = policy.retry(|_| async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }
}
