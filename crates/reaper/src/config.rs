//! Configuration resolution from the process environment.
//!
//! Only two knobs exist: the age threshold and the audit log location.
//! Unset and empty variables both fall back to the defaults.

use std::env::VarError;

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Maximum container age in minutes before it is removed
pub const RUNNING_TIME_ENV: &str = "DOCKER_RUNNING_TIME";
/// Path of the append-only audit log
pub const CLEANUP_LOG_ENV: &str = "DOCKER_CLEANUP_LOG";

pub const DEFAULT_THRESHOLD_MINUTES: i64 = 60;
pub const DEFAULT_LOG_PATH: &str = "docker_cleanup.log";

/// Resolved settings for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Containers older than this many minutes are removed. Zero and
    /// negative values are accepted as-is.
    pub threshold_minutes: i64,
    /// Where removal records are appended
    pub log_path: Utf8PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold_minutes: DEFAULT_THRESHOLD_MINUTES,
            log_path: Utf8PathBuf::from(DEFAULT_LOG_PATH),
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_var)
    }

    /// Resolve configuration using an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Result<Option<String>>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).map(|v| v.filter(|v| !v.is_empty()));

        let threshold_minutes = match non_empty(RUNNING_TIME_ENV)? {
            Some(raw) => raw
                .parse::<i64>()
                .wrap_err_with(|| format!("Failed to parse {RUNNING_TIME_ENV}={raw:?}"))?,
            None => DEFAULT_THRESHOLD_MINUTES,
        };

        let log_path = non_empty(CLEANUP_LOG_ENV)?
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_LOG_PATH));

        Ok(Self {
            threshold_minutes,
            log_path,
        })
    }
}

/// Read an environment variable; unset is `None`, non-UTF-8 is an error.
pub fn env_var(key: &str) -> Result<Option<String>> {
    match std::env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(raw)) => Err(eyre!("{key} is not valid UTF-8: {raw:?}")),
    }
}
