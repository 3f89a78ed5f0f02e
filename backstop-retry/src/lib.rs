//! Retry and backoff for backstop transports
//!
//! Offsite copies run over a remote shell and fail for ordinary network
//! reasons. [`retry`] re-runs such an operation under a [`RetryPlan`]: an
//! attempt budget plus an exponential delay schedule. Each failure must be
//! tagged transient or permanent first, usually through [`classify`].

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a retried operation
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("{operation} gave up after {attempts} attempt(s): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxedCause,
    },
    #[error("{operation} failed, will retry: {source}")]
    Transient {
        operation: &'static str,
        source: BoxedCause,
    },
    #[error("{operation} failed: {source}")]
    Permanent {
        operation: &'static str,
        source: BoxedCause,
    },
}

impl RetryError {
    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. }
            | RetryError::Transient { operation, .. }
            | RetryError::Permanent { operation, .. } => operation,
        }
    }

    /// The error the operation itself reported
    pub fn into_source(self) -> BoxedCause {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }
}

pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Errors that know whether trying again can help
pub trait RetryableError {
    fn is_transient(&self) -> bool;

    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Tag `err` as [`RetryError::Transient`] or [`RetryError::Permanent`]
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    let transient = err.is_transient();
    let source: BoxedCause = Box::new(err);
    if transient {
        RetryError::Transient { operation, source }
    } else {
        RetryError::Permanent { operation, source }
    }
}

/// Attempt budget and delay schedule for one retried operation
#[derive(Debug, Clone)]
pub struct RetryPlan {
    attempts: usize,
    delays: ExponentialBackoff,
}

impl RetryPlan {
    /// At least one attempt is always made
    pub fn new(attempts: usize, delays: ExponentialBackoff) -> Self {
        Self {
            attempts: attempts.max(1),
            delays,
        }
    }

    /// Remote copies: slow first retry, capped at 30 s between attempts and
    /// ten minutes overall
    pub fn for_transfers(attempts: usize) -> Self {
        Self::new(
            attempts,
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_secs(2))
                .with_max_interval(Duration::from_secs(30))
                .with_max_elapsed_time(Some(Duration::from_secs(600)))
                .with_multiplier(2.0)
                .build(),
        )
    }

    /// Remote diagnostics and listings: quick to give up
    pub fn for_commands(attempts: usize) -> Self {
        Self::new(
            attempts,
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(250))
                .with_max_interval(Duration::from_secs(2))
                .with_max_elapsed_time(Some(Duration::from_secs(15)))
                .build(),
        )
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Delay before attempt `attempt + 1`, or `None` when the budget is spent
    fn delay_after(&mut self, attempt: usize) -> Option<Duration> {
        if attempt >= self.attempts {
            return None;
        }
        self.delays.next_backoff()
    }
}

/// Run `op` under `plan`
///
/// `op` receives the 1-based attempt number. A permanent error is returned
/// as is; a transient one is retried until the plan runs out, then reported
/// as [`RetryError::MaxRetriesExceeded`].
pub async fn retry<F, Fut, T>(
    operation: &'static str,
    mut plan: RetryPlan,
    mut op: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = RetryResult<T>>,
{
    plan.delays.reset();
    let mut attempt = 1;

    loop {
        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(operation, attempt, error = %err, "Not retrying");
                return Err(err);
            }
            Err(err) => err,
        };

        let Some(delay) = plan.delay_after(attempt) else {
            warn!(operation, attempts = attempt, error = %err, "Retry budget exhausted");
            return Err(RetryError::MaxRetriesExceeded {
                operation,
                attempts: attempt,
                source: err.into_source(),
            });
        };
        warn!(operation, attempt, ?delay, error = %err, "Attempt failed, backing off");

        #[cfg(feature = "async-rt")]
        tokio::time::sleep(delay).await;
        #[cfg(not(feature = "async-rt"))]
        std::thread::sleep(delay);

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct LinkError(&'static str, bool);

    impl RetryableError for LinkError {
        fn is_transient(&self) -> bool {
            self.1
        }
    }

    fn instant(attempts: usize) -> RetryPlan {
        RetryPlan::new(
            attempts,
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(5))
                .with_max_elapsed_time(None)
                .build(),
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let result = retry("push", instant(3), |attempt| async move { Ok(attempt) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recovers_from_dropped_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry("push", instant(5), move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(classify("push", LinkError("connection reset", true)))
                } else {
                    Ok("copied")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "copied");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: RetryResult<()> = retry("push", instant(5), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(classify("push", LinkError("permission denied (publickey)", false))) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_keeps_last_cause() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: RetryResult<()> = retry("pull", instant(2), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(classify("pull", LinkError("timed out", true))) }
        })
        .await;

        match result {
            Err(err @ RetryError::MaxRetriesExceeded { .. }) => {
                assert_eq!(err.operation(), "pull");
                let RetryError::MaxRetriesExceeded { attempts, source, .. } = err else {
                    unreachable!()
                };
                assert_eq!(attempts, 2);
                assert_eq!(source.to_string(), "timed out");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_plan_always_allows_one_attempt() {
        assert_eq!(RetryPlan::for_transfers(0).attempts(), 1);
        assert_eq!(RetryPlan::for_commands(4).attempts(), 4);
    }
}
