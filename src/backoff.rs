//! Retry with exponential backoff.
//!
//! HTTP 5xx and connection errors from provider APIs are transient and
//! frequent under concurrent load. The wait before attempt `n` (1-based
//! retry index) is `base_delay * 2^(n-1)`, capped at `max_delay`: with
//! 500 ms base and 3 retries the sequence is 500 ms → 1 s → 2 s.
//!
//! Which errors are worth another attempt is decided by an injected
//! predicate, so cancellation (and anything else the caller considers final)
//! is returned immediately. A cancelled token also interrupts the sleep.

use std::future::Future;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// retries, or `cancel` fires.
///
/// `op` receives the 0-based attempt number. On cancellation during a wait
/// the last error is returned; the caller maps it to its own cancellation
/// outcome by checking the token.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) || attempt >= policy.max_retries || cancel.is_cancelled() {
            return Err(err);
        }

        attempt += 1;
        let delay = policy.delay_for(attempt);
        warn!(
            "attempt failed ({}), retry {}/{} after {}ms",
            err,
            attempt,
            policy.max_retries,
            delay.as_millis()
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = sleep(delay) => {}
        }
    }
}
