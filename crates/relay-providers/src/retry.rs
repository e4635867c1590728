use std::future::Future;
use std::time::Duration;

use crate::erp::ErpError;

/// Bounded retry with jittered exponential backoff for transient upstream
/// failures. Permanent errors return immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(6));
        exp + jitter(exp)
    }
}

fn jitter(base: Duration) -> Duration {
    // Cheap pseudo-jitter off the monotonic clock; up to 25% of the base.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    let cap = (base.as_millis() as u64 / 4).max(1);
    Duration::from_millis(nanos % cap)
}

pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, ErpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ErpError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient upstream failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ErpError::Transport("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ErpError::Remote("bad request".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ErpError::Transport("down".to_string())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
