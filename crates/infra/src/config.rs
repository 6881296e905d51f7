//! Configuration loading and representation.
//!
//! Everything comes from `TAGTRAIL_*` environment variables. Unset variables
//! take their defaults; set but unparseable ones are an error.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::external_ledger::LedgerCredentials;
use crate::reconcile::ReconcileConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_LEDGER_BASE_URL: &str = "https://api-ma.metrc.com";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration of the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Registry + ledger database. `None` keeps everything in memory.
    pub database_url: Option<String>,
    /// Retry queue database. Defaults to a sibling of `database_url`.
    pub retry_queue_url: Option<String>,
    pub ledger_base_url: String,
    /// `None` when the API key or license number is missing.
    pub ledger_credentials: Option<LedgerCredentials>,
    pub reconcile: ReconcileConfig,
    /// Queue length of each fan-out observer.
    pub fanout_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (the environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or("TAGTRAIL_BIND_ADDR", get("TAGTRAIL_BIND_ADDR"), || {
            DEFAULT_BIND_ADDR.parse().map_err(|e| format!("{e}"))
        })?;

        let database_url = get("TAGTRAIL_DATABASE_URL");
        let retry_queue_url = get("TAGTRAIL_RETRY_QUEUE_URL")
            .or_else(|| database_url.as_deref().map(retry_queue_url_for));

        let ledger_base_url =
            get("TAGTRAIL_LEDGER_BASE_URL").unwrap_or_else(|| DEFAULT_LEDGER_BASE_URL.to_string());

        let ledger_credentials = match (
            get("TAGTRAIL_LEDGER_API_KEY"),
            get("TAGTRAIL_LEDGER_LICENSE"),
        ) {
            (Some(api_key), Some(license_number)) => Some(LedgerCredentials {
                api_key,
                license_number,
            }),
            _ => None,
        };

        let defaults = ReconcileConfig::default();
        let reconcile = ReconcileConfig {
            submit_timeout: secs("TAGTRAIL_SUBMIT_TIMEOUT_SECS", get, defaults.submit_timeout)?,
            retry_interval: secs("TAGTRAIL_RETRY_INTERVAL_SECS", get, defaults.retry_interval)?,
            base_delay: secs("TAGTRAIL_RETRY_BASE_DELAY_SECS", get, defaults.base_delay)?,
            max_delay: secs("TAGTRAIL_RETRY_MAX_DELAY_SECS", get, defaults.max_delay)?,
        };

        let fanout_capacity = parse_or(
            "TAGTRAIL_FANOUT_CAPACITY",
            get("TAGTRAIL_FANOUT_CAPACITY"),
            || Ok(tagtrail_events::DEFAULT_OBSERVER_CAPACITY),
        )?;
        if fanout_capacity == 0 {
            return Err(invalid("TAGTRAIL_FANOUT_CAPACITY", "0", "must be at least 1"));
        }

        Ok(Self {
            bind_addr,
            database_url,
            retry_queue_url,
            ledger_base_url,
            ledger_credentials,
            reconcile,
            fanout_capacity,
        })
    }
}

/// `sqlite://data/units.db` → `sqlite://data/units.retry.db`.
fn retry_queue_url_for(database_url: &str) -> String {
    match database_url.strip_suffix(".db") {
        Some(stem) => format!("{stem}.retry.db"),
        None => format!("{database_url}.retry"),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T, D>(var: &'static str, raw: Option<String>, default: D) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    D: FnOnce() -> Result<T, String>,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &value, e.to_string())),
        None => default().map_err(|e| invalid(var, "", e)),
    }
}

fn secs<G>(var: &'static str, get: G, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(var, get(var), || Ok(default.as_secs()))?;
    if secs == 0 {
        return Err(invalid(var, "0", "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}
