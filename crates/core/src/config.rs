//! Server configuration.
//!
//! Loaded from YAML. Every field has a default so a partial file (or none at
//! all) yields a working configuration. Durations are Go-style strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::duration::serde_go;

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "OPTIMUS_LOG_LEVEL";

/// Resource manager kind understood by the external resolver.
pub const RESOURCE_MANAGER_OPTIMUS: &str = "optimus";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path read
        path: String,
        /// Cause
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Deployment worker pool
    pub deploy: DeployConfig,
    /// Replay worker pool and syncer
    pub replay: ReplayConfig,
    /// External control planes to query for dependencies
    pub resource_managers: Vec<ResourceManagerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            deploy: DeployConfig::default(),
            replay: ReplayConfig::default(),
            resource_managers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.is_empty() {
                tracing::debug!("log level overridden by {}", LOG_LEVEL_ENV);
                self.log_level = level;
            }
        }
    }
}

/// Deployment worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Concurrent deployments
    pub num_workers: usize,
    /// Deadline per deployment
    #[serde(with = "serde_go")]
    pub worker_timeout: Duration,
    /// Queued deployments accepted before back-pressure
    pub queue_capacity: usize,
    /// Pause between assignment passes
    #[serde(with = "serde_go")]
    pub assign_interval: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            worker_timeout: Duration::from_secs(30 * 60),
            queue_capacity: 10,
            assign_interval: Duration::from_secs(1),
        }
    }
}

impl DeployConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set the per-deployment deadline.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the assignment interval.
    pub fn with_assign_interval(mut self, interval: Duration) -> Self {
        self.assign_interval = interval;
        self
    }
}

/// Replay worker pool and syncer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Concurrent replays
    pub num_workers: usize,
    /// Deadline per replay worker pass
    #[serde(with = "serde_go")]
    pub worker_timeout: Duration,
    /// Queued replays accepted before back-pressure
    pub queue_capacity: usize,
    /// A replay not yet replayed after this long is failed
    #[serde(with = "serde_go")]
    pub run_timeout: Duration,
    /// Pause between syncer passes
    #[serde(with = "serde_go")]
    pub sync_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            worker_timeout: Duration::from_secs(120),
            queue_capacity: 100,
            run_timeout: Duration::from_secs(3 * 60 * 60),
            sync_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl ReplayConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set the per-replay deadline.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the run timeout enforced by the syncer.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Set the syncer interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// An external control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManagerConfig {
    /// Display name
    pub name: String,
    /// Kind; only `optimus` is supported
    #[serde(rename = "type")]
    pub manager_type: String,
    /// Connection settings
    #[serde(default)]
    pub config: ResourceManagerEndpoint,
}

/// How to reach an external control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManagerEndpoint {
    /// Base URL
    pub host: String,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
