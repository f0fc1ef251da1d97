//! Timeouts and exponential backoff for store calls.
//!
//! Every store call goes through [`with_timeout`]; calls that may be retried
//! go through [`with_retry`], which uses failsafe's exponential backoff
//! (base delay, doubling, capped at `max_delay`).

use failsafe::backoff::{self, Exponential};
use std::future::Future;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::errors::MigrationError;

/// Smallest delay failsafe's backoff accepts for both the start and the cap.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Runs one store call under the policy's timeout.
pub async fn with_timeout<T, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    fut: Fut,
) -> Result<T, MigrationError>
where
    Fut: Future<Output = Result<T, MigrationError>>,
{
    match tokio::time::timeout(policy.timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MigrationError::Timeout {
            operation: operation.to_string(),
            after: policy.timeout,
        }),
    }
}

/// Backoff delays for `policy`. Delays below [`MIN_BACKOFF`] are raised to
/// it, and the cap is never below the start.
fn delays(policy: &RetryPolicy) -> Exponential {
    let start = policy.base_delay.max(MIN_BACKOFF);
    let max = policy.max_delay.max(start);
    backoff::exponential(start, max)
}

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// attempt ceiling is reached.
///
/// # Arguments
///
/// * `policy` - Attempt ceiling, backoff delays and per-call timeout.
/// * `operation` - Short description used in logs and errors.
/// * `call` - Produces a fresh future for every attempt.
///
/// # Returns
///
/// * `Result<T, MigrationError>` - The first successful value. A
///   non-transient error is returned unchanged after the attempt that hit
///   it; exhausting the ceiling yields [`MigrationError::RetryExhausted`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, MigrationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MigrationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = delays(policy).take(max_attempts.saturating_sub(1) as usize);
    let mut attempt = 1;

    loop {
        let err = match with_timeout(policy, operation, call()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }

        match delays.next() {
            Some(delay) => {
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    max_attempts,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                return Err(MigrationError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }
        }
    }
}
