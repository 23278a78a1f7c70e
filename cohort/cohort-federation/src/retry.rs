//! Retry with exponential backoff for transient failures.

use cohort_core::config::RetryConfig;
use cohort_core::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first included
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            multiplier: config.multiplier,
        }
    }
}

/// Result of an operation run under a retry policy
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Calculate backoff delay after the given failed attempt (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error, or
    /// the attempt budget is spent
    pub async fn execute_with_retry<F, Fut, T>(&self, what: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) if attempts < self.max_attempts && e.is_transient() => {
                    let delay = self.calculate_delay(attempts);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempts, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::error::CohortError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(800));
        assert_eq!(policy.calculate_delay(20), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let attempted = policy
            .execute_with_retry("publish", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CohortError::topic_unavailable("cohort"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(attempted.result.unwrap(), 7);
        assert_eq!(attempted.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion() {
        let policy = RetryPolicy::default();
        let attempted: Attempted<()> = policy
            .execute_with_retry("publish", || async {
                Err(CohortError::topic_unavailable("cohort"))
            })
            .await;
        assert!(attempted.result.is_err());
        assert_eq!(attempted.attempts, 5);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::default();
        let attempted: Attempted<()> = policy
            .execute_with_retry("publish", || async {
                Err(CohortError::internal("encoding failed"))
            })
            .await;
        assert_eq!(attempted.attempts, 1);
    }
}
