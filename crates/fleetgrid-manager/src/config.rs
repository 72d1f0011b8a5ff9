//! Manager configuration (`fleetgrid.toml`).
//!
//! ```toml
//! watch_interval_secs = 10
//! task_ttl = 450
//!
//! [retry]
//! max_attempts = 10
//! initial_delay_ms = 50
//! max_delay_ms = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use fleetgrid_state::RetryConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Period of each watcher loop.
    pub watch_interval_secs: u64,
    /// Watcher passes an in-progress task may hold its lease.
    pub task_ttl: u32,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watch_interval_secs: 10,
            task_ttl: 450,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            ..RetryConfig::default()
        }
    }
}
