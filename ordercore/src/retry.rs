//! Bounded retry of a read-compute-commit unit of work.
//!
//! The unit of work is a closure that re-reads everything it needs on each
//! attempt, so retrying after a version conflict never reuses stale state.
//! Delays grow exponentially with jitter and are capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::StoreError;

/// Configuration for retrying a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after `attempt` (1-based) failed.
    ///
    /// The nominal delay is `base_delay * multiplier^(attempt - 1)`, capped at
    /// `max_delay`, then jittered by ±25% and capped again.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let nominal = if factor.is_finite()
            && self.base_delay.as_secs_f64() * factor < self.max_delay.as_secs_f64()
        {
            self.base_delay.mul_f64(factor)
        } else {
            self.max_delay
        };

        let jitter = rand::rng().random_range(0.75..=1.25);
        nominal.mul_f64(jitter).min(self.max_delay)
    }
}

/// Policy defining which errors should trigger a retry.
#[derive(Debug, Clone, Copy, Default)]
pub enum RetryPolicy {
    /// Only retry on version conflicts.
    #[default]
    ConflictsOnly,
    /// Retry on version conflicts and on an unavailable store.
    ConflictsAndTransient,
}

impl RetryPolicy {
    /// Determines if an error should trigger a retry.
    pub const fn should_retry(self, error: &StoreError) -> bool {
        match self {
            Self::ConflictsOnly => error.is_conflict(),
            Self::ConflictsAndTransient => error.is_retryable(),
        }
    }
}

/// Why a retried unit of work gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// The last error encountered
        last_error: E,
    },

    /// A non-retryable error ended the loop early.
    #[error("{0}")]
    Aborted(E),
}

/// Runs `unit` until it succeeds, fails with an error `should_retry`
/// rejects, or `config.max_attempts` attempts were made.
///
/// `unit` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut, P>(
    operation: &'static str,
    config: &RetryConfig,
    should_retry: P,
    mut unit: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match unit(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !should_retry(&error) => return Err(RetryError::Aborted(error)),
            Err(error) if attempt >= max_attempts => {
                warn!(operation, attempts = attempt, %error, "Retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
            Err(error) => {
                let delay = config.delay_after(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis(),
                    %error,
                    "Retrying after conflict"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
