//! Bounded-attempts retry.
//!
//! Each attempt is built fresh by the caller's closure (which receives the
//! 1-based attempt number), so state can be re-derived between attempts
//! instead of replaying a stale operation.

use std::future::Future;

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error that is not worth retrying.
    Fatal(E),
}

/// Run `op` up to `max_attempts` times (at least once), retrying only while
/// `is_retryable` accepts the error.
pub async fn retry_bounded<T, E, F, Fut, R>(
    max_attempts: u32,
    mut op: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(_) => attempt += 1,
        }
    }
}
