//! Conflict-retry controller.
//!
//! Wraps one strategy invocation and re-runs it from scratch whenever the
//! store reports a concurrency conflict. Every other error is returned on
//! the spot.

use crate::{Result, WalletError};
use metrics::counter;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff settings for one mutation path. Partial overrides from config are
/// layered onto that path's preset by [`crate::config::EngineConfig`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn locked_path() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }

    pub fn conditional_path() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// `policy.max_attempts` is spent. The closure is called afresh per attempt
/// so each attempt opens its own transaction.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt, "succeeded after conflict retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                if attempt >= max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "conflict retries exhausted"
                    );
                    counter!("wallet.retry.exhausted", "operation" => operation_name.to_string())
                        .increment(1);
                    return Err(WalletError::ConcurrencyExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "concurrency conflict, retrying"
                );
                counter!("wallet.retry.attempts", "operation" => operation_name.to_string())
                    .increment(1);

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_reference_presets() {
        let locked = RetryPolicy::locked_path();
        assert_eq!(locked.max_attempts, 5);
        assert_eq!(locked.delay_for(1), Duration::from_millis(100));
        assert_eq!(locked.delay_for(2), Duration::from_millis(200));
        assert_eq!(locked.delay_for(4), Duration::from_millis(800));

        let conditional = RetryPolicy::conditional_path();
        assert_eq!(conditional.max_attempts, 3);
        assert_eq!(conditional.delay_for(1), Duration::from_millis(50));
        assert_eq!(conditional.delay_for(2), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 300,
            ..RetryPolicy::locked_path()
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_on_conflict(&fast(5), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WalletError::Conflict("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_conflict() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = retry_on_conflict(&fast(3), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(WalletError::Conflict(format!("attempt {n}")))
            }
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            WalletError::ConcurrencyExhausted {
                attempts: 3,
                last: "Conflict: attempt 2".to_string(),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let wallet_id = Uuid::now_v7();

        let result: Result<()> = retry_on_conflict(&fast(5), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WalletError::insufficient_funds(wallet_id, dec!(1), dec!(2)))
            }
        })
        .await;

        assert!(matches!(result, Err(WalletError::InsufficientFunds { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let result = retry_on_conflict(&fast(0), "test", || async {
            Err::<(), _>(WalletError::Conflict("busy".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(WalletError::ConcurrencyExhausted { attempts: 1, .. })
        ));
    }
}
