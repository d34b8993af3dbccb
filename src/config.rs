//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// How a matched message is re-sent to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    /// Synthesize a minimal header block in front of the decoded body.
    #[default]
    Rebuild,
    /// Re-send the original payload with Resent-* headers prepended.
    /// Falls back to `Rebuild` for messages fetched without a payload.
    Raw,
}

impl ForwardMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rebuild" => Some(Self::Rebuild),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time between poll passes.
    pub polling_interval: Duration,
    /// Connect/login attempts before giving up on a poll task.
    pub max_retry_count: u32,
    /// Pause between connect/login attempts.
    pub retry_interval: Duration,
    pub forward_mode: ForwardMode,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Outcomes older than this are pruned at startup. `None` keeps everything.
    pub log_retention_days: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(300), // 5 minutes
            max_retry_count: 3,
            retry_interval: Duration::from_secs(60),
            forward_mode: ForwardMode::Rebuild,
            db_path: PathBuf::from("./data/mail-dispatcher.db"),
            log_retention_days: None,
        }
    }
}

impl DispatcherConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let polling_secs = parse_or(&lookup, "MAIL_POLLING_INTERVAL", 300u64);
        if polling_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_POLLING_INTERVAL".into(),
                message: "must be greater than zero".into(),
            });
        }

        let max_retry_count = parse_or(&lookup, "MAIL_MAX_RETRY_COUNT", 3u32);
        let retry_secs = parse_or(&lookup, "MAIL_RETRY_INTERVAL", 60u64);

        let forward_mode = match lookup("MAIL_FORWARD_MODE") {
            Some(raw) => ForwardMode::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "MAIL_FORWARD_MODE".into(),
                message: format!("expected 'rebuild' or 'raw', got '{raw}'"),
            })?,
            None => defaults.forward_mode,
        };

        let db_path = lookup("DISPATCHER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let log_retention_days = match lookup("MAIL_LOG_RETENTION_DAYS") {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                key: "MAIL_LOG_RETENTION_DAYS".into(),
                message: format!("expected a number of days, got '{raw}'"),
            })?),
            None => None,
        };

        Ok(Self {
            polling_interval: Duration::from_secs(polling_secs),
            max_retry_count,
            retry_interval: Duration::from_secs(retry_secs),
            forward_mode,
            db_path,
            log_retention_days,
        })
    }

    /// Retry policy for mailbox connect/login.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_count, self.retry_interval)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "Invalid value, using default");
            default
        }),
        None => default,
    }
}
