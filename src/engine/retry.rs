use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::EngineError;

/// How writers wait for room and payment locks, and how often a transaction
/// that hit a transient store error is retried.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Bound on acquiring each lock of a transaction.
    pub lock_timeout: Duration,
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Run a whole transaction, retrying transient failures with exponential
/// backoff. Exhausted retries surface as `Contention`; every other error is
/// returned as is.
pub(super) async fn retry_transient<F, Fut, T>(
    policy: &LockPolicy,
    operation: &'static str,
    mut attempt_txn: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut delay = policy.initial_delay;
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match attempt_txn().await {
            Err(err) if err.is_transient() => {
                metrics::counter!(crate::observability::TXN_RETRIES_TOTAL, "operation" => operation)
                    .increment(1);
                if attempt == max_attempts {
                    warn!(operation, attempt, error = %err, "giving up under contention");
                    return Err(EngineError::Contention(attempt));
                }
                debug!(
                    operation,
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
            other => return other,
        }
    }

    Err(EngineError::Contention(max_attempts))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::engine::error::TransientKind;

    fn fast_policy(max_attempts: u32) -> LockPolicy {
        LockPolicy {
            lock_timeout: Duration::from_millis(5),
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(4), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Transient(TransientKind::LockTimeout))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_contention() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Transient(TransientKind::StaleRead)) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Contention(3))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Forbidden("nope")) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Forbidden(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
