//! Engine configuration with type-safe validation.
//!
//! Every tunable is a `nutype` newtype validated at construction, so an
//! `EngineConfig` that exists is always usable. The configuration
//! deserializes from any serde format; missing sections fall back to the
//! defaults.

use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Maximum number of attempts for a retried unit of work.
///
/// Validated to be between 1 and 10.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Delay before the first retry, in milliseconds (1ms to 10s).
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Cap on any single retry delay, in milliseconds (1ms to 5 minutes).
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Exponential backoff multiplier, between 1.0 and 4.0.
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 4.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// Age after which an untouched `pending` order expires, in seconds.
///
/// Validated to be between one minute and 30 days.
#[nutype(
    validate(greater_or_equal = 60, less_or_equal = 2_592_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StalenessThresholdSecs(u64);

impl StalenessThresholdSecs {
    /// The threshold as a chrono duration, for comparing timestamps.
    pub fn as_chrono(self) -> chrono::Duration {
        let secs: u64 = self.into();
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

/// Interval between reconciliation sweeps, in seconds (1s to 7 days).
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 604_800),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SweepIntervalSecs(u64);

impl SweepIntervalSecs {
    /// Convert to Duration for use with tokio::time::interval.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into())
    }
}

/// Largest accepted difference between a supplied and a computed amount.
#[nutype(
    validate(predicate = |tolerance: &Decimal| *tolerance >= Decimal::ZERO && *tolerance <= Decimal::ONE),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct PriceTolerance(Decimal);

/// Validated retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of attempts.
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry.
    pub base_delay: RetryBaseDelayMs,
    /// Cap on any single delay.
    pub max_delay: RetryMaxDelayMs,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: BackoffMultiplier,
}

impl RetrySettings {
    /// Settings for the stock reservation unit of work: five attempts, a
    /// short base delay and a 200ms cap.
    ///
    /// # Errors
    ///
    /// Returns validation errors if any of the preset values are invalid
    /// (which should never happen with proper constants).
    pub fn reservation() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            max_attempts: MaxRetryAttempts::try_new(5)?,
            base_delay: RetryBaseDelayMs::try_new(10)?,
            max_delay: RetryMaxDelayMs::try_new(200)?,
            backoff_multiplier: BackoffMultiplier::try_new(2.0)?,
        })
    }

    /// Settings for synchronization actions: three quick attempts.
    pub fn sync() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            max_attempts: MaxRetryAttempts::try_new(3)?,
            base_delay: RetryBaseDelayMs::try_new(5)?,
            max_delay: RetryMaxDelayMs::try_new(100)?,
            backoff_multiplier: BackoffMultiplier::try_new(2.0)?,
        })
    }

    /// Returns a copy with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: MaxRetryAttempts) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Converts to the runtime retry configuration.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.into(),
            base_delay: self.base_delay.as_duration(),
            max_delay: self.max_delay.as_duration(),
            backoff_multiplier: self.backoff_multiplier.into(),
        }
    }
}

/// Configuration shared by every engine component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry budget of the stock reservation unit of work.
    pub reservation_retry: RetrySettings,
    /// Retry budget of a single synchronization action.
    pub sync_retry: RetrySettings,
    /// Tolerance for subtotal, total and catalog price checks.
    pub price_tolerance: PriceTolerance,
    /// Age after which the sweep expires an untouched pending order.
    pub staleness_threshold: StalenessThresholdSecs,
    /// Interval of the sweep scheduler.
    pub sweep_interval: SweepIntervalSecs,
}

impl EngineConfig {
    /// Create a configuration with the defaults: five reservation attempts,
    /// three sync attempts, a 0.01 tolerance and a daily sweep expiring
    /// orders untouched for 24 hours.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            reservation_retry: RetrySettings::reservation()?,
            sync_retry: RetrySettings::sync()?,
            price_tolerance: PriceTolerance::try_new(Decimal::new(1, 2))?,
            staleness_threshold: StalenessThresholdSecs::try_new(86_400)?,
            sweep_interval: SweepIntervalSecs::try_new(86_400)?,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new().expect("Default engine configuration should always be valid")
    }
}
