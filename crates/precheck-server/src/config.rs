// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for precheck-server.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the job store
    pub database_url: String,
    /// Data directory holding `uploads/`, `runs/` and the default database
    pub data_dir: PathBuf,
    /// Maximum number of workers running at once
    pub max_concurrent: usize,
    /// How long an upload stays available for new runs
    pub upload_expiry: Duration,
    /// Admission scheduler tick interval
    pub scheduler_poll_interval: Duration,
    /// Expiry reaper tick interval
    pub reaper_poll_interval: Duration,
    /// Container CLI binary
    pub docker_bin: String,
    /// Worker image
    pub docker_image: String,
    /// Name prefix for worker containers
    pub container_prefix: String,
    /// Grace period when stopping a worker
    pub stop_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let database_url = std::env::var("PRECHECK_DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite:{}?mode=rwc", data_dir.join("precheck.db").display())
        });

        let max_concurrent: usize = parse_env("PRECHECK_MAX_CONCURRENT", 1)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                var: "PRECHECK_MAX_CONCURRENT",
                value: "0".to_string(),
            });
        }

        let expiry_minutes: u64 = parse_env("PRECHECK_UPLOAD_EXPIRY_MINUTES", 15)?;
        let scheduler_poll_ms: u64 = parse_env("PRECHECK_SCHEDULER_POLL_MS", 1000)?;
        let reaper_poll_secs: u64 = parse_env("PRECHECK_REAPER_POLL_SECS", 60)?;
        let stop_timeout_secs: u64 = parse_env("PRECHECK_STOP_TIMEOUT_SECS", 10)?;

        let docker_bin = std::env::var("PRECHECK_DOCKER_BIN").unwrap_or_else(|_| "docker".into());
        let docker_image = std::env::var("PRECHECK_DOCKER_IMAGE")
            .unwrap_or_else(|_| "ghcr.io/wafer-space/gf180mcu-precheck:latest".to_string());
        let container_prefix =
            std::env::var("PRECHECK_CONTAINER_PREFIX").unwrap_or_else(|_| "precheck-".to_string());

        Ok(Self {
            database_url,
            data_dir,
            max_concurrent,
            upload_expiry: minutes("PRECHECK_UPLOAD_EXPIRY_MINUTES", expiry_minutes)?,
            scheduler_poll_interval: Duration::from_millis(scheduler_poll_ms),
            reaper_poll_interval: Duration::from_secs(reaper_poll_secs),
            docker_bin,
            docker_image,
            container_prefix,
            stop_timeout: Duration::from_secs(stop_timeout_secs),
        })
    }
}

/// Parse an optional env var, falling back to `default` when unset.
fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Convert a minute count to a duration, rejecting values that overflow.
fn minutes(var: &'static str, count: u64) -> Result<Duration, ConfigError> {
    count
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            var,
            value: count.to_string(),
        })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value that failed to parse.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_default_when_unset() {
        let value: u64 = parse_env("PRECHECK_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_invalid_value_error_message() {
        let err = ConfigError::InvalidValue {
            var: "PRECHECK_MAX_CONCURRENT",
            value: "many".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for PRECHECK_MAX_CONCURRENT: \"many\""
        );
    }

    #[test]
    fn test_minutes() {
        assert_eq!(
            minutes("PRECHECK_UPLOAD_EXPIRY_MINUTES", 15).unwrap(),
            Duration::from_secs(900)
        );

        let err = minutes("PRECHECK_UPLOAD_EXPIRY_MINUTES", u64::MAX).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "PRECHECK_UPLOAD_EXPIRY_MINUTES",
                ..
            }
        ));
    }
}
