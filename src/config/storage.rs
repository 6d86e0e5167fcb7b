//! Configuration Storage
//!
//! Handles reading/writing the rule file to disk.
//! Default location: ~/.portfwd/rules.json

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{ConfigFile, ForwardSettings, CONFIG_VERSION};
use crate::forwarding::{RuleSpec, RuleStore};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the portfwd configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".portfwd"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the default rules file path
pub fn rules_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("rules.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
    settings: ForwardSettings,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(rules_file()?))
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            settings: ForwardSettings::default(),
        }
    }

    /// Ensure the config directory exists
    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Load configuration from disk
    /// Returns default config if file doesn't exist
    /// If config is corrupted, creates a backup and returns default config
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<ConfigFile>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Config file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted config backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err);
                        }
                    }

                    Ok(ConfigFile::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Load the config, writing an empty one first if the file is missing
    pub async fn load_or_init(&mut self) -> Result<ConfigFile, StorageError> {
        if !self.exists().await {
            tracing::info!("Config file {:?} not found, creating an empty one", self.path);
            self.save(&ConfigFile::default()).await?;
        }
        let config = self.load().await?;
        self.settings = config.settings.clone();
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Check if config file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Create a backup of the current config
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[async_trait]
impl RuleStore for ConfigStorage {
    async fn load_rules(&self) -> Result<Vec<RuleSpec>, StorageError> {
        Ok(self.load().await?.rules)
    }

    async fn save_rules(&self, rules: &[RuleSpec]) -> Result<(), StorageError> {
        let config = ConfigFile {
            version: CONFIG_VERSION,
            settings: self.settings.clone(),
            rules: rules.to_vec(),
        };
        self.save(&config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(name: &str, port: u16) -> RuleSpec {
        RuleSpec::new(name, port, "10.0.0.5", 80)
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("rules.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.rules.is_empty());
    }

    #[tokio::test]
    async fn test_load_or_init_creates_file() {
        let temp = tempdir().unwrap();
        let mut storage = ConfigStorage::with_path(temp.path().join("nested/rules.json"));

        let config = storage.load_or_init().await.unwrap();
        assert!(config.rules.is_empty());
        assert!(storage.exists().await);
    }

    #[tokio::test]
    async fn test_rules_round_trip_keeps_order_and_settings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rules.json");
        let mut config = ConfigFile::default();
        config.settings.bind_address = "127.0.0.1".into();
        ConfigStorage::with_path(path.clone()).save(&config).await.unwrap();

        let mut storage = ConfigStorage::with_path(path);
        storage.load_or_init().await.unwrap();
        storage
            .save_rules(&[spec("web", 8080), spec("db", 5432)])
            .await
            .unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.settings.bind_address, "127.0.0.1");
        let names: Vec<_> = loaded.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["web", "db"]);
        assert_eq!(storage.load_rules().await.unwrap()[1].local_port, 5432);
    }

    #[tokio::test]
    async fn test_transient_fields_are_not_written() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("rules.json"));
        storage.save_rules(&[spec("web", 8080)]).await.unwrap();

        let raw = std::fs::read_to_string(storage.path()).unwrap();
        assert!(raw.contains("local_port"));
        assert!(!raw.contains("bytes_sent"));
        assert!(!raw.contains("is_running"));
    }

    #[tokio::test]
    async fn test_corrupted_config_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rules.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = ConfigStorage::with_path(path);
        let config = storage.load().await.unwrap();
        assert!(config.rules.is_empty());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rules.json");
        std::fs::write(&path, r#"{"version": 99, "rules": []}"#).unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
    }
}
