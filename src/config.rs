//! Backup configuration
//!
//! Everything an operation needs from the outside world is carried by a
//! [`BackupConfig`] handed to the [`BackupManager`](crate::backup::BackupManager)
//! at construction time. Nothing is read from process-wide state while an
//! operation is running.

use crate::backup::BackupError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Bucket to store archives in. When unset, the first bucket the
    /// account lists is used.
    pub bucket: Option<String>,
    /// Directory holding the temporary archive while it is built or restored
    pub scratch_directory: PathBuf,
    /// Gzip level, 0-9
    pub compression_level: u32,
    /// Object storage connection settings
    pub storage: StorageConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            scratch_directory: env::temp_dir().join("server-backups"),
            compression_level: 6,
            storage: StorageConfig::default(),
        }
    }
}

impl BackupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_scratch_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.scratch_directory = directory.into();
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9); // Max level is 9
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Build a configuration from `BACKUP_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, BackupError> {
        let mut config = Self::default();

        if let Some(bucket) = read_var("BACKUP_BUCKET") {
            config.bucket = Some(bucket);
        }
        if let Some(dir) = read_var("BACKUP_SCRATCH_DIR") {
            config.scratch_directory = PathBuf::from(dir);
        }
        if let Some(level) = read_var("BACKUP_COMPRESSION_LEVEL") {
            let level: u32 = level.parse().map_err(|_| {
                BackupError::Config(format!("BACKUP_COMPRESSION_LEVEL is not a number: {}", level))
            })?;
            config = config.with_compression_level(level);
        }
        if let Some(region) = read_var("BACKUP_REGION") {
            config.storage.region = region;
        }
        config.storage.endpoint_url = read_var("BACKUP_ENDPOINT_URL");
        if let Some(flag) = read_var("BACKUP_FORCE_PATH_STYLE") {
            config.storage.force_path_style = parse_flag("BACKUP_FORCE_PATH_STYLE", &flag)?;
        }

        match (read_var("BACKUP_KEY_ID"), read_var("BACKUP_APPLICATION_KEY")) {
            (Some(key_id), Some(application_key)) => {
                config.storage.credentials = Some(StorageCredentials::new(key_id, application_key));
            }
            (None, None) => {}
            _ => {
                return Err(BackupError::Config(
                    "BACKUP_KEY_ID and BACKUP_APPLICATION_KEY must be set together".to_string(),
                ))
            }
        }

        Ok(config)
    }
}

/// Object storage connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub region: String,
    /// Custom endpoint for S3-compatible services (Backblaze B2, MinIO, ...)
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub credentials: Option<StorageCredentials>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            credentials: None,
        }
    }
}

/// Account identifier and secret for the object store
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageCredentials {
    pub key_id: String,
    pub application_key: String,
}

impl StorageCredentials {
    pub fn new(key_id: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            application_key: application_key.into(),
        }
    }
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .finish()
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(name: &str, value: &str) -> Result<bool, BackupError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BackupError::Config(format!("{} is not a boolean: {}", name, other))),
    }
}
