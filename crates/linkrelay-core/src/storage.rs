//! Storage layer for settings (JSON file in the data directory)

use crate::error::RelayError;
use linkrelay_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for linkrelay data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, RelayError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Path of the transfer history database
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }

    /// Load settings, falling back to defaults when the file is missing
    pub async fn load_settings(&self) -> Result<Settings, RelayError> {
        let path = self.settings_path();

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map_err(|e| {
            warn!("Invalid settings in {}: {}", path.display(), e);
            RelayError::Serialization(e.to_string())
        })
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), RelayError> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;

        // Write then rename so a crash never leaves half a file
        let tmp = self.data_dir.join(format!("{}.tmp", SETTINGS_FILE));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.settings_path()).await?;

        Ok(())
    }

    /// Delete the settings file so defaults apply again
    pub async fn reset_settings(&self) -> Result<(), RelayError> {
        match fs::remove_file(self.settings_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("data")).await.unwrap();

        let settings = storage.load_settings().await.unwrap();
        assert_eq!(settings.max_concurrent_per_user, 2);
        assert_eq!(settings.user_rate_limit, 5 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_save_load_reset() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();

        let mut settings = Settings::default();
        settings.max_concurrent_per_user = 4;
        settings.drive.token_file = Some(PathBuf::from("/tmp/token.json"));
        storage.save_settings(&settings).await.unwrap();

        let loaded = storage.load_settings().await.unwrap();
        assert_eq!(loaded.max_concurrent_per_user, 4);
        assert_eq!(loaded.drive.token_file, Some(PathBuf::from("/tmp/token.json")));

        tokio_test::assert_ok!(storage.reset_settings().await);
        // Resetting twice is fine
        tokio_test::assert_ok!(storage.reset_settings().await);
        assert_eq!(storage.load_settings().await.unwrap().max_concurrent_per_user, 2);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
        std::fs::write(storage.settings_path(), r#"{"user_rate_limit": 0}"#).unwrap();

        let settings = storage.load_settings().await.unwrap();
        assert_eq!(settings.user_rate_limit, 0);
        assert_eq!(settings.worker_pool_size, 10);
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
        std::fs::write(storage.settings_path(), "{ nope").unwrap();

        assert!(matches!(
            storage.load_settings().await,
            Err(RelayError::Serialization(_))
        ));
    }
}
