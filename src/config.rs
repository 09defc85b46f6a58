//! # Sync Manager Configuration
//!
//! Loads and bootstraps the TOML configuration that drives every component of
//! the pipeline. Each section maps onto one component:
//!
//! ```text
//! config.toml
//! ├── [mqtt]       - broker address, credentials, QoS, timeouts
//! │   └── [mqtt.backoff]
//! ├── [outbox]     - SQLite location and processing timeout
//! ├── [dispatch]   - poll interval and batch size
//! ├── [dedup]      - cache TTL and size cap
//! ├── [heartbeat]  - liveness publishing
//! ├── [health]     - backlog age threshold
//! └── [service]    - service name and stop timeout
//! ```
//!
//! Missing sections and fields fall back to their defaults, so a partial file
//! (or an empty one) is always a valid configuration.

use crate::mqtt::config::MqttSettings;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const APP_DIR: &str = "sync-manager";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "outbox.db";

/// Root configuration object handed to the service at construction time.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub mqtt: MqttSettings,
    pub outbox: OutboxSettings,
    pub dispatch: DispatchSettings,
    pub dedup: DedupSettings,
    pub heartbeat: HeartbeatSettings,
    pub health: HealthSettings,
    pub service: ServiceSettings,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OutboxSettings {
    /// Path of the SQLite database. `:memory:` opens a private in-memory store.
    pub database_path: PathBuf,
    /// Claims older than this are considered abandoned by the periodic sweep.
    pub processing_timeout_secs: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            processing_timeout_secs: 300,
        }
    }
}

impl OutboxSettings {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// How often the running loop sweeps for stale claims.
    pub stale_sweep_interval_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            batch_size: 50,
            stale_sweep_interval_secs: 60,
        }
    }
}

impl DispatchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DedupSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub prune_interval_secs: u64,
    /// JSON pointer to the message ID inside a payload. Empty disables dedup.
    pub id_pointer: String,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            max_entries: 1000,
            prune_interval_secs: 30,
            id_pointer: "/data/id".to_string(),
        }
    }
}

impl DedupSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub topic: String,
    pub interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "sync-manager/heartbeat".to_string(),
            interval_secs: 60,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    /// A pending message older than this marks the backlog as stale.
    pub old_pending_age_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            old_pending_age_secs: 600,
        }
    }
}

impl HealthSettings {
    pub fn old_pending_age(&self) -> Duration {
        Duration::from_secs(self.old_pending_age_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    pub stop_timeout_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "sync-manager".to_string(),
            stop_timeout_ms: 5_000,
        }
    }
}

impl ServiceSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl SyncConfig {
    /// Reads and parses a configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: SyncConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Writes the configuration as pretty TOML, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize configuration: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }
}

/// Makes sure a configuration file exists at `path` and loads it.
///
/// A missing file is created from [`SyncConfig::default`] first.
pub async fn ensure_default_config(path: &Path) -> Result<SyncConfig> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

    if !exists {
        info!("Creating default configuration at {}", path.display());
        SyncConfig::default().save(path).await?;
    }

    SyncConfig::load(path).await
}

pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path.push(CONFIG_FILE);
    path
}

pub fn default_database_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path.push(DATABASE_FILE);
    path
}
