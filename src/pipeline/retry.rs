//! Bounded exponential backoff for persistence writes
//!
//! Only the coordinator drives retries. Each attempt is capped by the stage
//! timeout; only retryable `StoreError`s are attempted again.

use super::error::{PipelineError, StoreError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, Error)]
#[error("Maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.initial_delay, policy.max_delay, policy.max_retries)
    }

    /// Delay before the next retry, `None` once the budget is spent
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        let factor = 2_u32.saturating_pow(self.current_attempt);
        Some(std::cmp::min(
            self.initial_delay.saturating_mul(factor),
            self.max_delay,
        ))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::debug!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    /// Retries consumed so far
    pub fn retries(&self) -> u32 {
        self.current_attempt
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Errors:
/// - `StorageCorruption` on a corruption error (fatal, not retried)
/// - `PersistenceExhausted` once retries run out or the error is not retryable
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    entity: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = ExponentialBackoff::from_policy(policy);

    loop {
        let err = match timeout(policy.attempt_timeout, op()).await {
            Ok(Ok(value)) => {
                if backoff.retries() > 0 {
                    log::info!("✅ {} persisted after {} retries", entity, backoff.retries());
                }
                return Ok(value);
            }
            Ok(Err(err)) => err,
            Err(_) => StoreError::Timeout(policy.attempt_timeout),
        };

        if err.is_corruption() {
            log::error!("❌ Storage corruption while writing {}: {}", entity, err);
            return Err(PipelineError::StorageCorruption(err.to_string()));
        }

        if !err.is_retryable() {
            return Err(PipelineError::PersistenceExhausted {
                entity: entity.to_string(),
                attempts: backoff.retries(),
                reason: err.to_string(),
            });
        }

        log::warn!("⚠️  Write of {} failed: {}", entity, err);

        if backoff.sleep().await.is_err() {
            return Err(PipelineError::PersistenceExhausted {
                entity: entity.to_string(),
                attempts: backoff.retries(),
                reason: err.to_string(),
            });
        }
    }
}
