use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// How a failing store write is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn forever(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Run `op` until it succeeds. Every failure is logged with the store
/// endpoints, and the first success after a failure logs a recovery.
///
/// Only a bounded policy can give up; it then returns the last error.
pub async fn retry_until_success<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    endpoints: &[String],
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(attempts, "recover registration of '{}'", what);
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(attempts, endpoints = ?endpoints, "lost registration of '{}': {}", what, e);
                if policy.exhausted(attempts) {
                    return Err(e);
                }
                if policy.delay.is_zero() {
                    // a store that fails without blocking must not starve the runtime
                    tokio::task::yield_now().await;
                } else {
                    sleep(policy.delay).await;
                }
            }
        }
    }
}
