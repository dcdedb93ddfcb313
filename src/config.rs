//! Application configuration, read from `config.toml` in the data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flashcards::{LeechAction, LeechPolicy};
use crate::sync::{RetryPolicy, SyncOptions};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Could not write config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Could not determine the data directory")]
    DataDirNotFound,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Platform data directory for the app
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|p| p.join("mnemo"))
        .ok_or(ConfigError::DataDirNotFound)
}

/// Sync mode configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// User-triggered sync only
    #[default]
    Manual,
    /// Sync at regular intervals
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub enabled: bool,
    /// e.g. "https://sync.example.com"
    pub server_url: String,
    pub app_id: String,
    /// Remote key of the sync blob
    pub backup_name: String,
    pub sync_on_cellular: bool,
    pub mode: SyncMode,
    /// Seconds between periodic syncs
    pub interval_secs: u64,
    /// Ask before a manual sync replaces local data
    pub confirm_pull: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            app_id: "mnemo".to_string(),
            backup_name: "mnemo-sync.json".to_string(),
            sync_on_cellular: false,
            mode: SyncMode::Manual,
            interval_secs: 300,
            confirm_pull: true,
        }
    }
}

impl SyncSettings {
    /// A server has been set up
    pub fn is_configured(&self) -> bool {
        !self.server_url.trim().is_empty() && !self.app_id.trim().is_empty()
    }

    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            enabled: self.enabled,
            sync_on_cellular: self.sync_on_cellular,
            confirm_pull: self.confirm_pull,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Lapses before an item becomes a leech; 0 turns leech handling off
    pub leech_threshold: u32,
    pub leech_action: LeechAction,
    pub new_per_day: usize,
    /// Chance a due review is answered correctly, for workload projections
    pub retention_rate: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            leech_threshold: 8,
            leech_action: LeechAction::Suspend,
            new_per_day: 20,
            retention_rate: 0.9,
        }
    }
}

impl SchedulerSettings {
    pub fn leech_policy(&self) -> LeechPolicy {
        LeechPolicy {
            threshold: self.leech_threshold,
            action: self.leech_action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    /// Soft-deleted decks and series are purged after this many days
    pub purge_after_days: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { purge_after_days: 30 }
    }
}

impl StorageSettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.purge_after_days))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            attempt_timeout_secs: policy.attempt_timeout.as_secs(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncSettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub retry: RetrySettings,
}

impl AppConfig {
    /// Load from `data_dir/config.toml`; a missing file yields the defaults
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        std::fs::write(data_dir.join(CONFIG_FILE), toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.scheduler.leech_policy(), LeechPolicy::default());
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
[sync]
enabled = true
server_url = "https://sync.example.com"
mode = "periodic"

[scheduler]
leech_action = "tag"
"#,
        )
        .unwrap();

        let config = AppConfig::load(dir.path()).unwrap();
        assert!(config.sync.enabled);
        assert!(config.sync.is_configured());
        assert_eq!(config.sync.mode, SyncMode::Periodic);
        assert_eq!(config.sync.backup_name, "mnemo-sync.json");
        assert_eq!(config.scheduler.leech_action, LeechAction::Tag);
        assert_eq!(config.scheduler.leech_threshold, 8);
        assert_eq!(config.storage.purge_after_days, 30);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.sync.server_url = "https://sync.example.com".to_string();
        config.retry.max_attempts = 5;
        config.save(dir.path()).unwrap();

        assert_eq!(AppConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[sync\nenabled = ").unwrap();
        assert!(matches!(AppConfig::load(dir.path()), Err(ConfigError::Parse(_))));
    }
}
