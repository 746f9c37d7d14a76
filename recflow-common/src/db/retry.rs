//! Lock-contention retry
//!
//! SQLite reports a busy writer as "database is locked". Those errors are retried with a
//! doubling delay until the wait budget runs out; any other error returns on the spot.

use std::time::{Duration, Instant};

use crate::Result;

const FIRST_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 1_000;

/// Delay before each retry: 10 ms doubling up to 1 s
fn delays() -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(FIRST_DELAY_MS), |ms| Some((ms * 2).min(MAX_DELAY_MS)))
        .map(Duration::from_millis)
}

/// Run `operation` until it succeeds, fails for a reason other than lock contention, or
/// `max_wait_ms` has passed. An exhausted budget returns the last lock error.
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
    let mut delays = delays();
    let mut retries = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::debug!(operation = operation_name, retries, "Lock cleared");
                }
                return Ok(value);
            }
            Err(err) if err.is_lock_contention() => err,
            Err(err) => return Err(err),
        };

        let delay = delays.next().unwrap_or(Duration::from_millis(MAX_DELAY_MS));
        if Instant::now() + delay > deadline {
            tracing::error!(operation = operation_name, retries, max_wait_ms, "Gave up waiting for database lock");
            return Err(err);
        }
        retries += 1;
        tracing::warn!(operation = operation_name, retries, delay_ms = delay.as_millis() as u64, "Database locked");
        tokio::time::sleep(delay).await;
    }
}
