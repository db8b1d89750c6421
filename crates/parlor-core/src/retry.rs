//! Bounded retry with a deadline per attempt.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::telemetry;

/// How many times to try, how long each try may take, and how long to wait
/// between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create a policy. Zero attempts is treated as one.
    #[must_use]
    pub const fn new(attempts: u32, backoff: Duration, attempt_timeout: Duration) -> Self {
        Self {
            attempts,
            backoff,
            attempt_timeout,
        }
    }
}

/// Why a single attempt failed.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    /// The attempt did not finish before its deadline.
    TimedOut(Duration),
    /// The attempt returned an error.
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::TimedOut(after) => write!(f, "timed out after {after:?}"),
            AttemptFailure::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Every attempt failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made.
    pub attempts: u32,
    /// Failure of the final attempt.
    pub last: AttemptFailure<E>,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number. Each attempt is cancelled at
/// the policy's deadline, so a hung operation costs one timeout rather than
/// stalling the caller.
///
/// # Errors
///
/// Returns [`Exhausted`] carrying the last failure when no attempt succeeded.
pub async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let started = Instant::now();
        let failure = match timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                telemetry::record_attempt(operation, "ok", started.elapsed());
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                telemetry::record_attempt(operation, "error", started.elapsed());
                AttemptFailure::Failed(e)
            }
            Err(_) => {
                telemetry::record_attempt(operation, "timeout", started.elapsed());
                AttemptFailure::TimedOut(policy.attempt_timeout)
            }
        };

        if attempt >= attempts {
            return Err(Exhausted {
                attempts: attempt,
                last: failure,
            });
        }

        warn!(operation, attempt, error = %failure, "Attempt failed, retrying");
        sleep(policy.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run(&policy(2), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("boom") }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert!(matches!(exhausted.last, AttemptFailure::Failed("boom")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_second_attempt() {
        let result = run(&policy(3), "test", |attempt| async move {
            if attempt < 2 {
                Err("not yet")
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_times_out_hung_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), Exhausted<&str>> = run(&policy(2), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending()
        })
        .await;

        assert!(matches!(
            result.unwrap_err().last,
            AttemptFailure::TimedOut(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Two deadlines plus one backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = run(&policy(0), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("boom") }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
