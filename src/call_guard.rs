//! CallGuard - Bounded execution for blocking adapter calls
//!
//! ## Responsibilities
//!
//! - Wrap any adapter future with a hard timeout
//! - Abandon the call early when the abort token fires
//! - Fixed-backoff retry for transient failures
//!
//! Dropping the wrapped future on timeout releases the underlying
//! connection (reqwest / rumqttc futures are cancel-safe).

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` bounded by `limit` and by `cancel`.
///
/// Whichever of completion, timeout or cancellation comes first wins.
pub async fn run_bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(operation)),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    limit_ms = limit.as_millis() as u64,
                    "Bounded call timed out"
                );
                Err(Error::Timeout {
                    operation,
                    after: limit,
                })
            }
        },
    }
}

/// Fixed-backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (min 1)
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no retry
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Invoke `call(attempt)` until it succeeds or attempts run out.
    ///
    /// Non-transient errors and cancellation stop immediately.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && e.is_transient() => {
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled(operation)),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_run_bounded_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<()> = run_bounded("slow call", Duration::from_secs(1), &cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::Timeout { operation: "slow call", .. })
        ));
    }

    #[tokio::test]
    async fn test_run_bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let value = run_bounded("fast call", Duration::from_secs(1), &cancel, async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_bounded_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = run_bounded("camera capture", Duration::from_secs(5), &cancel, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled("camera capture"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(500));

        let value = policy
            .retry("flaky", &cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::Camera("status 503".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(100));

        let result: Result<()> = policy
            .retry("always failing", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Camera("connection refused".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let result: Result<()> = policy
            .retry("model load", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::ModelUnavailable("no weights".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::ModelUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
