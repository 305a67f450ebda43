//! Session tunables, loadable from TOML.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueuePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reported in every message header.
    pub username: String,
    /// Address locally launched kernels listen on.
    pub ip: String,
    /// Where connection files of launched kernels are written.
    pub runtime_dir: Option<PathBuf>,
    /// Maximum number of executions waiting or running; unbounded when unset.
    pub queue_depth: Option<usize>,
    /// Queue policy applied when the caller does not pick one.
    pub interrupt_policy: QueuePolicy,
    pub request_timeout_ms: u64,
    pub interrupt_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    /// Time a launched kernel gets to exit after shutdown before it is killed.
    pub kill_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_misses: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: env::var("USER").unwrap_or_else(|_| "orrery".to_string()),
            ip: "127.0.0.1".to_string(),
            runtime_dir: None,
            queue_depth: None,
            interrupt_policy: QueuePolicy::default(),
            request_timeout_ms: 10_000,
            interrupt_timeout_ms: 5_000,
            shutdown_timeout_ms: 5_000,
            startup_timeout_ms: 30_000,
            kill_grace_ms: 2_000,
            heartbeat_interval_ms: 3_000,
            heartbeat_misses: 3,
        }
    }
}

impl SessionConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("orrery"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
