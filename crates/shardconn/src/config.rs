//! Shard topology configuration.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::postgres::PoolOptions;
use crate::driver::{Capabilities, DriverKind};
use crate::router::UnknownKeyPolicy;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_IDLE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config must list at least one node")]
    NoNodes,
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Configuration for a set of shards.
///
/// ```json
/// {
///   "driver": "postgres",
///   "nodes": ["host=db0 user=app", "host=db1 user=app"],
///   "unknown_keys": "reject"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardConfig {
    pub driver: DriverKind,
    /// Connection strings, one per shard. Position is the shard index.
    pub nodes: Vec<String>,
    #[serde(default)]
    pub unknown_keys: UnknownKeyPolicy,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Set to false to disable savepoints even if the driver supports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoints: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_max_idle() -> usize {
    DEFAULT_MAX_IDLE
}

impl ShardConfig {
    pub fn new(driver: DriverKind, nodes: Vec<String>) -> Self {
        ShardConfig {
            driver,
            nodes,
            unknown_keys: UnknownKeyPolicy::default(),
            pool: PoolConfig::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            savepoints: None,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let config: ShardConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        Ok(())
    }

    /// Capabilities connections are created with.
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = self.driver.default_capabilities();
        if let Some(savepoints) = self.savepoints {
            caps.savepoints &= savepoints;
        }
        caps
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_idle: self.pool.max_idle,
            connect_timeout: self.connect_timeout(),
        }
    }
}
