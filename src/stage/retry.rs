//! Bounded retry with exponential backoff for stage start-up.

use crate::config::RetryConfig;
use crate::error::{StageError, StageKind};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry policy for transient stage failures.
///
/// Only failures whose [`StageError::is_retryable`] is true are retried; fatal
/// failures surface on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Formula: min(initial * 2^(attempt-1), max) plus 0-10% jitter, capped at max.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(attempt - 1);
        let delay = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        if !self.jitter {
            return delay;
        }
        let jitter = delay.mul_f64(rand::random::<f64>() * 0.1);
        (delay + jitter).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. Backoff sleeps end early with a
/// cancellation error if `cancel` fires.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    kind: StageKind,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    stage = %kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure: {err}"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(StageError::cancelled(kind)),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
