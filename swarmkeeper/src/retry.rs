//! Bounded polling and retry.
//!
//! Every wait in swarmkeeper goes through here: a fixed sleep interval between attempts and a
//! hard attempt limit. Running out of attempts is an error, never an endless loop.

use std::future::Future;
use std::time::Duration;

use crate::error::ApiError;

#[cfg(test)]
#[path = "retry.test.rs"]
mod tests;

/// Errors that may be worth another attempt.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for ApiError {
    fn is_transient(&self) -> bool {
        ApiError::is_transient(self)
    }
}

impl Retryable for std::convert::Infallible {
    fn is_transient(&self) -> bool {
        match *self {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between two attempts. No sleep happens after the last attempt.
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            interval,
            max_attempts,
        }
    }

    pub const fn from_secs(interval_secs: u64, max_attempts: u32) -> Self {
        RetryPolicy::new(Duration::from_secs(interval_secs), max_attempts)
    }

    /// Upper bound on the time spent sleeping by one wait.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RetryError<E> {
    #[error("{what} did not complete after {attempts} attempts")]
    Exhausted {
        what: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("{0}")]
    Failed(E),
}

/// Poll `check` until it yields `Some(value)`.
///
/// `Ok(None)` and transient errors consume one attempt each. Any other error stops the wait
/// immediately.
pub async fn poll_until<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut check: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match check().await {
            Ok(Some(value)) => {
                tracing::debug!(what=%what, attempt, "Wait completed");
                return Ok(value);
            }
            Ok(None) => {
                tracing::trace!(what=%what, attempt, "Still waiting");
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(what=%what, attempt, error=%err, "Transient failure while waiting");
                last_error = Some(err.to_string());
            }
            Err(err) => return Err(RetryError::Failed(err)),
        }

        if attempt < policy.max_attempts && !policy.interval.is_zero() {
            tokio::time::sleep(policy.interval).await;
        }
    }

    tracing::error!(what=%what, attempts=policy.max_attempts, "Gave up waiting");
    Err(RetryError::Exhausted {
        what: what.to_string(),
        attempts: policy.max_attempts,
        last_error,
    })
}

/// Run `op` until it succeeds, retrying transient errors.
pub async fn retry_transient<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    poll_until(policy, what, || {
        let fut = op();
        async move { fut.await.map(Some) }
    })
    .await
}
