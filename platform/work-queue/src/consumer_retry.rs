//! Retry with exponential backoff for queue-facing operations
//!
//! Used by producers to ride out short broker outages before reporting a
//! publish as failed, and by relays that re-publish in the background.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Every error is treated as retriable. See [`retry_with_backoff_if`] to stop
/// early on errors that will not go away by themselves.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(operation, |_| true, config, context).await
}

/// Retry a fallible async operation while `should_retry` accepts the error
///
/// # Returns
/// * `Ok(T)` as soon as an attempt succeeds
/// * `Err(E)` with the last error once attempts are exhausted, or immediately
///   for an error `should_retry` rejects
///
/// # Example
/// ```rust
/// use work_queue::consumer_retry::{retry_with_backoff_if, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let value = retry_with_backoff_if(
///     || async { Ok::<_, String>(42) },
///     |e: &String| !e.starts_with("fatal"),
///     &config,
///     "example_operation",
/// )
/// .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    operation: F,
    should_retry: P,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                warn!(context = %context, attempt, error = %e, "Operation failed with non-retriable error");
                return Err(e);
            }
            Err(e) if attempt >= config.max_attempts.max(1) => {
                warn!(context = %context, attempts = attempt, error = %e, "Operation failed after max retries");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    context = %context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
