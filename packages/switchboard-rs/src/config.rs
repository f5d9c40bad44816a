use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::cache::CacheLimits;

/// Mediator configuration: cache ceilings and sweep cadence.
///
/// Deserializes from any serde source with every field optional, or loads from
/// `SWITCHBOARD_*` environment variables with [`from_env`](Self::from_env).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub cache: CacheLimits,
    pub sweep_interval_secs: u64,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            cache: CacheLimits::default(),
            sweep_interval_secs: 30 * 60,
        }
    }
}

impl MediatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Set-but-invalid values are errors.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            cache: CacheLimits {
                max_query_thunks: parse_or(
                    &lookup,
                    "SWITCHBOARD_MAX_QUERY_THUNKS",
                    defaults.cache.max_query_thunks,
                )?,
                max_command_thunks: parse_or(
                    &lookup,
                    "SWITCHBOARD_MAX_COMMAND_THUNKS",
                    defaults.cache.max_command_thunks,
                )?,
                max_event_thunks: parse_or(
                    &lookup,
                    "SWITCHBOARD_MAX_EVENT_THUNKS",
                    defaults.cache.max_event_thunks,
                )?,
                max_handlers: parse_or(
                    &lookup,
                    "SWITCHBOARD_MAX_HANDLERS",
                    defaults.cache.max_handlers,
                )?,
            },
            sweep_interval_secs: parse_or(
                &lookup,
                "SWITCHBOARD_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            bail!("SWITCHBOARD_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        None => Ok(default),
    }
}
