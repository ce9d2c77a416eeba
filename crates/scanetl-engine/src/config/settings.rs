//! Engine settings
//!
//! Process-level knobs loaded from `SCANETL_*` environment variables. Pipeline
//! documents can override the batching defaults per sink.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::ConfigError;

pub const DEFAULT_BATCH_SIZE: usize = 1024;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PROVIDER_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Root for per-run artifacts (command captures, staged files, error logs)
    pub work_dir: PathBuf,
    /// Batch size used by sinks that do not set one
    pub batch_size: usize,
    /// Idle flush interval used by sinks that do not set one
    pub flush_interval_secs: u64,
    /// Depth of each provider's entry queue
    pub provider_queue_depth: usize,
    /// Upper bound on how long `close()` waits for a producer task
    pub close_timeout_secs: u64,
    /// PostgreSQL URL for persisted run sessions; in-memory store when unset
    pub run_store_url: Option<String>,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("scanetl")
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key: var.to_string(),
            message: format!("cannot parse `{}`", raw),
        }),
        Err(_) => Ok(default),
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            provider_queue_depth: DEFAULT_PROVIDER_QUEUE_DEPTH,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
            run_store_url: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from environment variables
    ///
    /// - `SCANETL_WORK_DIR`
    /// - `SCANETL_BATCH_SIZE`
    /// - `SCANETL_FLUSH_INTERVAL_SECS`
    /// - `SCANETL_PROVIDER_QUEUE_DEPTH`
    /// - `SCANETL_CLOSE_TIMEOUT_SECS`
    /// - `SCANETL_RUN_STORE_URL`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            work_dir: std::env::var("SCANETL_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            batch_size: env_or("SCANETL_BATCH_SIZE", defaults.batch_size)?,
            flush_interval_secs: env_or(
                "SCANETL_FLUSH_INTERVAL_SECS",
                defaults.flush_interval_secs,
            )?,
            provider_queue_depth: env_or(
                "SCANETL_PROVIDER_QUEUE_DEPTH",
                defaults.provider_queue_depth,
            )?,
            close_timeout_secs: env_or("SCANETL_CLOSE_TIMEOUT_SECS", defaults.close_timeout_secs)?,
            run_store_url: std::env::var("SCANETL_RUN_STORE_URL").ok(),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |key: &str, value: u64| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                })
            } else {
                Ok(())
            }
        };

        positive("SCANETL_BATCH_SIZE", self.batch_size as u64)?;
        positive("SCANETL_FLUSH_INTERVAL_SECS", self.flush_interval_secs)?;
        positive("SCANETL_PROVIDER_QUEUE_DEPTH", self.provider_queue_depth as u64)?;
        positive("SCANETL_CLOSE_TIMEOUT_SECS", self.close_timeout_secs)?;
        Ok(())
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}
