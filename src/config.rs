//! Queue configuration parsing and validation.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::retry::{RetryPolicy, MAX_BACKOFF};
use crate::{AppError, Result};

/// Drain loop tuning: batch size, retry ceiling, backoff and timeouts.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct DrainConfig {
    /// Attempts after which a failing record becomes `dead`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Records selected per drain cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Backoff before the first retry.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound for the exponential backoff (before jitter).
    #[serde(default = "default_cap_backoff_ms")]
    pub cap_backoff_ms: u64,
    /// Maximum extra random delay as a fraction of the backoff.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Per-call handler timeout; expiry counts as a transport error.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    /// Idle wait between drain cycles while online.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_batch_size() -> u32 {
    20
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_cap_backoff_ms() -> u64 {
    300_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_call_timeout_seconds() -> u64 {
    30
}

fn default_poll_interval_seconds() -> u64 {
    30
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            base_backoff_ms: default_base_backoff_ms(),
            cap_backoff_ms: default_cap_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
            call_timeout_seconds: default_call_timeout_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl DrainConfig {
    /// Retry policy derived from the backoff settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            cap_backoff: Duration::from_millis(self.cap_backoff_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }

    /// Per-call handler timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Idle wait between drain cycles.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Config(
                "max_attempts must be greater than zero".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.cap_backoff_ms < self.base_backoff_ms {
            return Err(AppError::Config(
                "cap_backoff_ms must not be smaller than base_backoff_ms".into(),
            ));
        }
        if u128::from(self.cap_backoff_ms) > MAX_BACKOFF.as_millis() {
            return Err(AppError::Config(format!(
                "cap_backoff_ms must not exceed {}",
                MAX_BACKOFF.as_millis()
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(AppError::Config(
                "jitter_ratio must be between 0.0 and 1.0".into(),
            ));
        }
        if self.call_timeout_seconds == 0 {
            return Err(AppError::Config(
                "call_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "poll_interval_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Network reachability settings feeding the connectivity gate.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectivityConfig {
    /// Endpoint probed to decide online/offline; no probe when absent.
    #[serde(default)]
    pub probe_url: Option<String>,
    /// Seconds between probes.
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    /// Initial gate state when no probe is configured.
    #[serde(default)]
    pub start_online: bool,
}

fn default_probe_interval_seconds() -> u64 {
    15
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_seconds: default_probe_interval_seconds(),
            start_online: false,
        }
    }
}

/// Remote endpoint for one queue channel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelConfig {
    /// URL receiving the queued payload.
    pub url: String,
    /// Environment variable holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub auth_token_env: Option<String>,
}

impl ChannelConfig {
    /// Resolve the bearer token from the configured environment variable.
    ///
    /// A missing variable is logged and treated as "no token" so that the
    /// queue keeps capturing work; the server will reject the calls.
    #[must_use]
    pub fn bearer_token(&self) -> Option<String> {
        let key = self.auth_token_env.as_deref()?;
        match env::var(key) {
            Ok(value) if !value.is_empty() => Some(value),
            _ => {
                warn!(env_key = key, "bearer token env var is not set");
                None
            }
        }
    }
}

/// Top-level configuration parsed from the queue TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Location of the `SQLite` queue database.
    pub db_path: PathBuf,
    /// Drain loop settings.
    #[serde(default)]
    pub drain: DrainConfig,
    /// Connectivity gate settings.
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    /// Channel name → remote endpoint.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl QueueConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Interval between connectivity probes.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.probe_interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(AppError::Config("db_path must not be empty".into()));
        }
        self.drain.validate()?;

        if self.connectivity.probe_url.is_some() && self.connectivity.probe_interval_seconds == 0 {
            return Err(AppError::Config(
                "probe_interval_seconds must be greater than zero".into(),
            ));
        }

        for (name, channel) in &self.channels {
            if name.trim().is_empty() {
                return Err(AppError::Config("channel name must not be empty".into()));
            }
            if channel.url.trim().is_empty() {
                return Err(AppError::Config(format!("channel {name} has an empty url")));
            }
        }

        Ok(())
    }
}
