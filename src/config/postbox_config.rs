//! Postbox configuration file handling
//!
//! Loads and manages ~/.config/postbox/config.yaml.

use crate::model::MailLimits;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which storage engine holds the mail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One YAML file per sent mail plus a drafts file
    #[default]
    Files,
    /// A single SQLite database
    Sqlite,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Files => "files",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Root directory of the file backend (mail/, drafts.yml, groups.yml)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file of the sqlite backend
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn postbox_home() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("postbox");
    path
}

fn default_data_dir() -> PathBuf {
    postbox_home().join("data")
}

fn default_database() -> PathBuf {
    postbox_home().join("mail.db")
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            data_dir: default_data_dir(),
            database: default_database(),
            wal_mode: true,
        }
    }
}

/// Retention sweeper and deferred notification cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Delete sent mail older than this many days; disabled when absent
    #[serde(default)]
    pub max_age_days: Option<u32>,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_notify_interval")]
    pub notify_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_notify_interval() -> u64 {
    60
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: None,
            sweep_interval_secs: default_sweep_interval(),
            notify_interval_secs: default_notify_interval(),
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_interval_secs)
    }
}

/// Cash-on-delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    #[serde(default = "default_true")]
    pub money_price_enabled: bool,

    #[serde(default = "default_true")]
    pub item_price_enabled: bool,

    /// Roll back when the sender's balance does not grow by exactly the fee
    #[serde(default = "default_true")]
    pub verify_deposit: bool,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            money_price_enabled: true,
            item_price_enabled: true,
            verify_deposit: true,
        }
    }
}

/// Attachment box geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxConfig {
    #[serde(default = "default_slots")]
    pub slots: usize,

    #[serde(default = "default_max_stack")]
    pub max_stack: u32,
}

fn default_slots() -> usize {
    54
}

fn default_max_stack() -> u32 {
    crate::model::items::DEFAULT_MAX_STACK
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            max_stack: default_max_stack(),
        }
    }
}

/// Remote identity service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Single-name lookup; `{name}` is replaced by the player name
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Batch lookup accepting a JSON array of names
    #[serde(default = "default_batch_endpoint")]
    pub batch_endpoint: String,

    #[serde(default = "default_rate_limit_retry")]
    pub rate_limit_retry_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_endpoint() -> String {
    "https://api.mojang.com/users/profiles/minecraft/{name}".to_string()
}

fn default_batch_endpoint() -> String {
    "https://api.mojang.com/profiles/minecraft".to_string()
}

fn default_rate_limit_retry() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            batch_endpoint: default_batch_endpoint(),
            rate_limit_retry_secs: default_rate_limit_retry(),
            max_retries: default_max_retries(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostboxConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub limits: MailLimits,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub escrow: EscrowConfig,

    #[serde(default)]
    pub boxes: BoxConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

impl PostboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path (~/.config/postbox/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::MailError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading postbox configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            backend = %config.storage.backend,
            retention_days = ?config.retention.max_age_days,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Load from the path if it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving postbox configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Default config path (~/.config/postbox/config.yaml)
    pub fn default_path() -> PathBuf {
        postbox_home().join("config.yaml")
    }

    /// Point both backends at one directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.storage.database = dir.join("mail.db");
        self.storage.data_dir = dir;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.storage.backend = backend;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention.max_age_days = Some(days);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PostboxConfig::new();
        assert_eq!(config.storage.backend, BackendKind::Files);
        assert_eq!(config.limits.max_recipients, 64);
        assert_eq!(config.retention.max_age_days, None);
        assert_eq!(config.retention.sweep_interval_secs, 3600);
        assert!(config.escrow.verify_deposit);
        assert_eq!(config.boxes.slots, 54);
        assert_eq!(config.identity.rate_limit_retry_secs, 60);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
storage:
  backend: sqlite
retention:
  max_age_days: 30
escrow:
  verify_deposit: false
"#;
        let config: PostboxConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.backend, BackendKind::Sqlite);
        assert!(config.storage.wal_mode);
        assert_eq!(config.retention.max_age_days, Some(30));
        assert_eq!(config.retention.notify_interval_secs, 60);
        assert!(!config.escrow.verify_deposit);
        assert!(config.escrow.money_price_enabled);
        assert_eq!(config.limits.max_body_lines, 64);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let config = PostboxConfig::new()
            .with_data_dir(dir.path())
            .with_backend(BackendKind::Sqlite)
            .with_retention_days(14);
        config.save(&path).unwrap();

        let loaded = PostboxConfig::load(&path).unwrap();
        assert_eq!(loaded.storage.backend, BackendKind::Sqlite);
        assert_eq!(loaded.storage.database, dir.path().join("mail.db"));
        assert_eq!(loaded.retention.max_age_days, Some(14));
    }

    #[test]
    fn test_load_missing_file() {
        let result = PostboxConfig::load("/nonexistent/postbox.yaml");
        assert!(matches!(result, Err(crate::MailError::Config(_))));
        assert!(PostboxConfig::load_or_default("/nonexistent/postbox.yaml").is_ok());
    }

    #[test]
    fn test_default_path() {
        let path = PostboxConfig::default_path();
        assert!(path.ends_with(".config/postbox/config.yaml"));
    }
}
