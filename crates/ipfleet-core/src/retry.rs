//! Bounded retry with exponential backoff
//!
//! Shared by the prober (constant pause between attempts) and the rotation
//! state machine (exponential backoff per provider call). Providers never
//! retry on their own; they return an error and the caller's policy decides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry budget for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt (in milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound for any single delay (in milliseconds)
    pub max_delay_ms: u64,
}

impl BackoffPolicy {
    /// Exponential policy: base delay doubling per attempt, capped at `max_delay`
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Constant pause between attempts
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay)
    }

    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self::constant(1, Duration::ZERO)
    }

    /// Default for rotation steps: 3 attempts, 1s doubling, capped at 8s
    pub fn rotation_default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(8))
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("Backoff max_attempts must be >= 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::config(
                "Backoff max_delay_ms must be >= base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (0-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::rotation_default()
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct Retried<T> {
    /// Final result: the first success, or the last error
    pub result: Result<T>,

    /// Attempts actually performed
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Whether the operation eventually succeeded
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy's
/// attempts are exhausted.
///
/// `op` receives the 0-based attempt number.
pub async fn retry<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(e) => {
                let exhausted = attempt + 1 >= max_attempts;
                if exhausted || !e.is_retryable() {
                    return Retried {
                        result: Err(e),
                        attempts: attempt + 1,
                    };
                }

                let delay = policy.delay_after(attempt);
                debug!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
