//! Exponential backoff with a cap, and an executor for retrying transient
//! failures in place.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use offsync_common::{Error, Result};

/// Exponential backoff policy.
///
/// The delay before retry `n` (1-based) is
/// `min(initial_delay * multiplier^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap for exponential growth, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to shave a random fraction (up to 25%) off each delay.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy with the given initial delay and cap, doubling.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay between retries.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Calculate the delay before retry number `retry` (1-based).
    ///
    /// `retry == 0` is treated as the first retry.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);

        let capped_delay = if base_delay.is_finite() {
            base_delay.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };

        let final_delay = if self.jitter {
            // Jitter only shortens, so the cap still holds
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Retry executor for running idempotent operations with in-place retries.
///
/// Only errors classified as transient by [`Error::is_transient`] are
/// retried.
pub struct RetryExecutor {
    policy: BackoffPolicy,
    max_retries: u32,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(policy: BackoffPolicy, max_retries: u32) -> Self {
        Self {
            policy,
            max_retries,
        }
    }

    /// Execute an operation with retry logic.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, Error::is_transient)
            .await
    }

    /// Execute with a custom retry condition.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(
                            "Operation failed after {} retries: {}",
                            self.max_retries, err
                        );
                        return Err(err);
                    }

                    let delay = self.policy.delay_for_retry(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Get the backoff policy.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_calculation() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10))
            .with_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(policy.delay_for_retry(6), Duration::from_secs(10));
        // Absurd exponents stay capped rather than overflowing
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(400))
            .with_jitter(true);

        for retry in 1..20 {
            let delay = policy.delay_for_retry(retry);
            assert!(delay <= Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(75));
        }
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"initial_delay_ms": 250}"#).unwrap();
        assert_eq!(policy.initial_delay(), Duration::from_millis(250));
        assert_eq!(policy.max_delay(), Duration::from_secs(60));
        assert_eq!(policy.multiplier, 2.0);
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_capped(
            initial in 1u64..5_000,
            cap in 1u64..120_000,
            multiplier in 1.0f64..8.0,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(initial),
                Duration::from_millis(cap),
            )
            .with_multiplier(multiplier);

            let mut previous = Duration::ZERO;
            for retry in 1..40 {
                let delay = policy.delay_for_retry(retry);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(cap));
                previous = delay;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_transport_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_secs(1)),
            3,
        );

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::Transport("Connection failed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::default();

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::InvalidInput("bad request".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_exceeded() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            2,
        );

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Timeout("Always fails".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        // Initial + 2 retries = 3 attempts
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }
}
