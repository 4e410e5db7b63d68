//! Operator configuration
//!
//! Loaded from a YAML file mounted from a `ConfigMap`. Every key is optional;
//! a missing file yields the built-in defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";
pub const ENV_CONFIG_PATH: &str = "OPERATOR_CONFIG";

const SIX_HOURS_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Namespace watched for maintenance resources and used for leases
    pub namespace: String,
    pub worker: WorkerJobConfig,
    pub lock: LockConfig,
    pub requeue: RequeueConfig,
    pub server: ServerConfig,
}

/// Settings applied to every worker Job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerJobConfig {
    pub image: String,
    pub service_account_name: Option<String>,
    pub active_deadline_seconds: i64,
    pub backoff_limit: i32,
    pub prom_url: Option<String>,
    pub stats_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    /// Lease duration; a crashed operator's lock is taken over after this
    pub lease_seconds: u64,
    /// Requeue interval while another holder owns the lock
    pub retry_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequeueConfig {
    pub running_seconds: u64,
    pub error_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "backup-system".to_string(),
            worker: WorkerJobConfig::default(),
            lock: LockConfig::default(),
            requeue: RequeueConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for WorkerJobConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/5dlabs/backup-worker:latest".to_string(),
            service_account_name: None,
            active_deadline_seconds: 21_600,
            backoff_limit: 0,
            prom_url: None,
            stats_url: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_seconds: SIX_HOURS_SECS,
            retry_seconds: 60,
        }
    }
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            running_seconds: 30,
            error_seconds: 60,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl OperatorConfig {
    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&config_str)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config YAML: {e}")))
    }

    /// Load from `OPERATOR_CONFIG` or the default mount, falling back to
    /// defaults when the file is absent
    pub fn load() -> Result<Self> {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = if Path::new(&path).exists() {
            debug!(path = %path, "loading operator configuration");
            Self::from_mounted_file(&path)?
        } else {
            warn!(path = %path, "configuration file not found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::ConfigError("namespace must not be empty".to_string()));
        }
        if self.worker.image.trim().is_empty() {
            return Err(Error::ConfigError("worker.image must not be empty".to_string()));
        }
        if self.worker.active_deadline_seconds <= 0 {
            return Err(Error::ConfigError(
                "worker.activeDeadlineSeconds must be positive".to_string(),
            ));
        }
        if self.worker.backoff_limit < 0 {
            return Err(Error::ConfigError("worker.backoffLimit must not be negative".to_string()));
        }
        if self.lock.lease_seconds == 0 || i32::try_from(self.lock.lease_seconds).is_err() {
            return Err(Error::ConfigError(
                "lock.leaseSeconds must be between 1 and 2147483647".to_string(),
            ));
        }
        if self.lock.retry_seconds == 0 || self.requeue.running_seconds == 0 || self.requeue.error_seconds == 0 {
            return Err(Error::ConfigError("requeue intervals must be positive".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lock.lease_seconds)
    }

    #[must_use]
    pub fn lock_retry(&self) -> Duration {
        Duration::from_secs(self.lock.retry_seconds)
    }

    #[must_use]
    pub fn running_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.running_seconds)
    }

    #[must_use]
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.error_seconds)
    }
}
