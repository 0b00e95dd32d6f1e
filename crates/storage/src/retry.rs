//! Retry logic for backend I/O
//!
//! Transient failures retry up to 3 times with exponential backoff
//! (100 ms, 400 ms, 1.6 s). Authentication failures abort immediately;
//! `Corrupt` is never retried; `Conflict` retries once for idempotent
//! operations.

use std::future::Future;
use std::time::Duration;

use vaulthalla_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl RetryPolicy {
    /// Backend I/O policy: 3 attempts, 100 ms initial, ×4 growth.
    pub fn backend_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 4.0,
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((self.initial_backoff.as_millis() as f32 * multiplier) as u64)
    }

    /// Run `operation` under this policy.
    ///
    /// Only `Transient` errors burn retry attempts; a still-failing
    /// operation surfaces as `Backend`. When `retry_conflict_once` is set
    /// (idempotent operations), a single `Conflict` gets one immediate
    /// re-attempt.
    pub async fn execute<F, Fut, T>(&self, retry_conflict_once: bool, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut conflict_retried = false;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(Error::Conflict(msg)) if retry_conflict_once && !conflict_retried => {
                    conflict_retried = true;
                    tracing::debug!(error = %msg, "conflict, retrying once");
                }
                Err(err) if err.is_transient() => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(Error::Backend(format!(
                            "operation failed after {} attempts: {err}",
                            self.max_attempts
                        )));
                    }
                    let backoff = self.backoff_duration(attempt);
                    tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "transient failure, backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backend_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::backend_default();
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(400));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn test_transient_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::backend_default()
        };

        let result = policy
            .execute(false, || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Transient("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_backend_error() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::backend_default()
        };
        let err = policy
            .execute(false, || async { Err::<(), _>(Error::Transient("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::backend_default();
        let err = policy
            .execute(false, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Unauthorized("bad key".into()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_retried_once_for_idempotent_ops() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::backend_default();
        let result = policy
            .execute(true, || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::Conflict("concurrent update".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);

        // A second conflict is surfaced.
        let err = policy
            .execute(true, || async { Err::<(), _>(Error::Conflict("again".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
