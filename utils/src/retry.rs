//! Bounded retry helpers.
//!
//! [`retry_with_backoff`] retries up to a fixed number of attempts, with
//! configurable fixed or exponential backoff. The attempt index is handed to
//! the operation so callers can run corrective work (for example a bus
//! rescan) before every attempt but the first.

use std::time::Duration;

use tracing::{debug, warn};

/// Backoff strategy for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: delay doubles each retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

/// Retry an operation up to `max_retries` times with configurable backoff.
///
/// Total attempts = 1 + `max_retries`. On each failure, `is_retryable` is
/// called: non-retryable errors are returned immediately without further
/// attempts. The last error is returned once attempts are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;

    loop {
        match attempt_fn(attempt).await {
            Ok(val) => {
                if attempt > 0 {
                    debug!(attempt, description, "Attempt succeeded after retries");
                }
                return Ok(val);
            }
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_retries {
                    return Err(e);
                }
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "Attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}
