use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::HotplugError;

/// Retry a fallible async operation with exponential backoff.
///
/// Only errors for which `HotplugError::is_retryable` holds are retried;
/// anything else is returned immediately.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh attempt. Each attempt must re-read its inputs.
pub async fn retry_retryable<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T, HotplugError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HotplugError>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
