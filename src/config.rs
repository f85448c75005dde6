//! Configuration loader and validator for the booking service.
use crate::lifecycle::BookingPolicy;
use crate::outbox::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub booking: BookingPolicy,
    #[serde(default)]
    pub outbox: Outbox,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Outbox delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Outbox {
    /// Failed deliveries are dropped after this many attempts; 0 never drops.
    pub max_attempts: u32,
    /// Per-recipient buffer of the live notification hub.
    pub hub_capacity: usize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            hub_capacity: 256,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a database file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/adbook.db", self.app.data_dir))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_backoff_secs: self.app.max_backoff_seconds as i64,
            max_attempts: i64::from(self.outbox.max_attempts),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.booking.payment_due_days <= 0 {
        return Err(ConfigError::Invalid("booking.payment_due_days must be > 0"));
    }
    if cfg.booking.max_description_len == 0 {
        return Err(ConfigError::Invalid("booking.max_description_len must be > 0"));
    }
    if cfg.booking.reversal_roles.is_empty() {
        return Err(ConfigError::Invalid("booking.reversal_roles must name at least one role"));
    }

    if cfg.outbox.hub_capacity == 0 {
        return Err(ConfigError::Invalid("outbox.hub_capacity must be > 0"));
    }

    Ok(())
}

/// Example configuration printed by `adbook example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300

booking:
  payment_due_days: 14
  max_description_len: 2000
  reversal_roles:
    - commercial
    - admin
    - director

outbox:
  max_attempts: 10
  hub_capacity: 256
"#
}
