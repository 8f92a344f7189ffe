//! Server configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `ORDERCORE_ADDR` | `0.0.0.0:8080` |
//! | `DATABASE_URL` | unset: in-memory store |
//! | `ORDERCORE_SWEEP_INTERVAL_SECS` | `86400` |
//! | `ORDERCORE_STALENESS_SECS` | `86400` |
//! | `ORDERCORE_RESERVATION_ATTEMPTS` | `5` |
//! | `ORDERCORE_LOG_FORMAT` | `text` |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use ordercore::config::{EngineConfig, MaxRetryAttempts, StalenessThresholdSecs, SweepIntervalSecs};
use thiserror::Error;

use crate::logging::LogFormat;

const DEFAULT_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);

/// A variable was set to a value that cannot be used.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {variable}: {reason}")]
pub struct ConfigError {
    /// Name of the environment variable
    pub variable: &'static str,
    /// Raw value found
    pub value: String,
    /// What was wrong with it
    pub reason: String,
}

/// Everything the server binary needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// PostgreSQL connection string; the in-memory store is used without one
    pub database_url: Option<String>,
    /// Engine tuning
    pub engine: EngineConfig,
    /// Log output format
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which returns a variable's
    /// value or `None` when unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let addr: SocketAddr = parse(&lookup, "ORDERCORE_ADDR")?.unwrap_or(DEFAULT_ADDR);

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let mut engine = EngineConfig::default();
        if let Some(secs) = parse::<u64, _>(&lookup, "ORDERCORE_SWEEP_INTERVAL_SECS")? {
            engine.sweep_interval = validated("ORDERCORE_SWEEP_INTERVAL_SECS", secs, SweepIntervalSecs::try_new)?;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ORDERCORE_STALENESS_SECS")? {
            engine.staleness_threshold =
                validated("ORDERCORE_STALENESS_SECS", secs, StalenessThresholdSecs::try_new)?;
        }
        if let Some(attempts) = parse::<u32, _>(&lookup, "ORDERCORE_RESERVATION_ATTEMPTS")? {
            let attempts = validated("ORDERCORE_RESERVATION_ATTEMPTS", attempts, MaxRetryAttempts::try_new)?;
            engine.reservation_retry = engine.reservation_retry.with_max_attempts(attempts);
        }

        let log_format: LogFormat = parse(&lookup, "ORDERCORE_LOG_FORMAT")?.unwrap_or_default();

        Ok(Self {
            addr,
            database_url,
            engine,
            log_format,
        })
    }
}

fn parse<T, F>(lookup: &F, variable: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(variable)
        .map(|value| {
            value.trim().parse().map_err(|error: T::Err| ConfigError {
                variable,
                value: value.clone(),
                reason: error.to_string(),
            })
        })
        .transpose()
}

fn validated<T, V, E>(
    variable: &'static str,
    raw: T,
    constructor: impl FnOnce(T) -> Result<V, E>,
) -> Result<V, ConfigError>
where
    T: Copy + std::fmt::Display,
    E: std::fmt::Display,
{
    constructor(raw).map_err(|error| ConfigError {
        variable,
        value: raw.to_string(),
        reason: error.to_string(),
    })
}
