//! Bounded retry for store writes that hit lock contention.

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Attempts and delay growth for a retried write. The wait before attempt
/// `n + 1` is `base_delay * n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation: &str, op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Store write succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
