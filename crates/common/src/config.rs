use crate::types::StoreId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default transfer chunk size (2 MiB). Both ends derive chunk boundaries
/// from this and the declared byte length.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Largest asset a client accepts to download (1 GiB).
pub const DEFAULT_MAX_ASSET_BYTES: u64 = 1024 * 1024 * 1024;

/// Minimum spacing between two outgoing pose updates.
pub const DEFAULT_POSE_INTERVAL_MS: u64 = 50;

/// Errors from loading client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client-wide settings. Every field has a default, so a config file only
/// needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name announced to joiners in the session `init` message.
    pub world_name: String,
    /// Chunk size for asset transfer, in bytes.
    pub chunk_size: usize,
    /// Declared asset lengths above this are refused before any chunk is fetched.
    pub max_asset_bytes: u64,
    /// Minimum interval between pose updates, in milliseconds.
    pub pose_interval_ms: u64,
    /// Directory of the durable content cache. `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    /// Store that receives uploads from this client.
    pub store_id: Option<StoreId>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            world_name: "khetworld".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            pose_interval_ms: DEFAULT_POSE_INTERVAL_MS,
            cache_dir: None,
            store_id: None,
        }
    }
}

impl ClientConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        serde_json::to_writer_pretty(std::fs::File::create(path)?, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.max_asset_bytes == 0 {
            return Err(ConfigError::Invalid("max_asset_bytes must be positive".into()));
        }
        if self.pose_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pose_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn pose_interval(&self) -> Duration {
        Duration::from_millis(self.pose_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_asset_bytes, DEFAULT_MAX_ASSET_BYTES);
        assert_eq!(config.pose_interval(), Duration::from_millis(50));
        assert!(config.cache_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{ "chunk_size": 1024 }"#).unwrap();

        let config = ClientConfig::load(tmp.path()).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.pose_interval_ms, DEFAULT_POSE_INTERVAL_MS);
        assert_eq!(config.world_name, "khetworld");
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{ "chunk_size": 0 }"#).unwrap();
        assert!(matches!(
            ClientConfig::load(tmp.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let config = ClientConfig {
            world_name: "plaza".into(),
            store_id: Some(StoreId::new()),
            ..ClientConfig::default()
        };
        config.save(tmp.path()).unwrap();
        assert_eq!(ClientConfig::load(tmp.path()).unwrap(), config);
    }
}
