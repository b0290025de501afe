//! Generic exponential-backoff retry, grounded on
//! `retry_with_exponential_backoff.py`: pure exponential, no jitter, a
//! caller-supplied retriability predicate, and the caller's own cancellation
//! (a dropped future simply stops retrying).

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry `operation` for at most `max_retries` total attempts, doubling
/// `initial_backoff` after each failed attempt.
///
/// `is_retriable` decides whether a given error is worth retrying; the first
/// non-retriable error, or the error from the last permitted attempt, is
/// returned as-is. `label` is used only for debug logging (per spec.md's
/// design notes, a caller-supplied label replaces the original's habit of
/// logging the retried callable's source).
pub async fn retry_with_backoff<T, E, Fut, F, R>(
    label: &str,
    mut operation: F,
    is_retriable: R,
    max_retries: u32,
    initial_backoff: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let is_last_attempt = attempt + 1 >= max_retries;
                if !is_retriable(&err) || is_last_attempt {
                    return Err(err);
                }
                debug!(label, attempt, backoff_ms = backoff.as_millis() as u64, "retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
        }
    }
}
