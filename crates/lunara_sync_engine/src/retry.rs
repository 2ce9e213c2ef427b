//! Retry with exponential backoff.

use crate::config::RetryConfig;
use crate::error::SyncResult;
use std::future::Future;
use tracing::debug;

/// Runs an async operation, retrying transient failures with exponential
/// backoff.
///
/// Only errors classified retryable by [`crate::SyncError::is_retryable`]
/// are retried; terminal errors (auth, validation, quota) surface
/// immediately.
/// After `max_attempts` the last error is returned and the caller decides
/// how to fail the cycle.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
