//! Cache storage configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{CacheError, CacheResult};

/// Default name of the cache seeded with bundled assets.
pub const DEFAULT_ASSET_CACHE_NAME: &str = "bundled-assets";

/// Configuration for the cache storage registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one database per scope
    pub data_dir: PathBuf,

    /// Origin relative scopes and bundled assets resolve against
    pub base_url: Url,

    /// Seed new storages with the bundled assets
    pub preload_assets: bool,

    /// Directory of bundled assets
    pub assets_dir: Option<PathBuf>,

    /// Cache that receives the bundled assets
    pub asset_cache_name: String,

    /// Attempts made to open a scope's database before giving up
    pub open_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rustkit")
                .join("service-worker-caches"),
            base_url: default_base_url(),
            preload_assets: false,
            assets_dir: None,
            asset_cache_name: DEFAULT_ASSET_CACHE_NAME.to_string(),
            open_attempts: 3,
        }
    }
}

impl CacheConfig {
    /// Configuration rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Enable asset seeding from `assets_dir`.
    pub fn with_assets(mut self, assets_dir: impl Into<PathBuf>) -> Self {
        self.preload_assets = true;
        self.assets_dir = Some(assets_dir.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("{}: {}", path.display(), e)))?;
        let config: CacheConfig = serde_json::from_str(&raw)
            .map_err(|e| CacheError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field combinations that serde cannot.
    pub fn validate(&self) -> CacheResult<()> {
        if self.preload_assets && self.assets_dir.is_none() {
            return Err(CacheError::Config(
                "preload_assets requires assets_dir".to_string(),
            ));
        }
        if self.open_attempts == 0 {
            return Err(CacheError::Config(
                "open_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_url.cannot_be_a_base() {
            return Err(CacheError::Config(format!(
                "base_url {} cannot be a base",
                self.base_url
            )));
        }
        crate::storage::validate_cache_name(&self.asset_cache_name)
    }
}

fn default_base_url() -> Url {
    Url::parse("https://localhost/").expect("static URL is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(!config.preload_assets);
        assert_eq!(config.asset_cache_name, DEFAULT_ASSET_CACHE_NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sw.json");
        std::fs::write(
            &path,
            r#"{ "data_dir": "/tmp/sw", "base_url": "app://bundle/", "open_attempts": 5 }"#,
        )
        .unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/sw"));
        assert_eq!(config.base_url.as_str(), "app://bundle/");
        assert_eq!(config.open_attempts, 5);
        assert_eq!(config.asset_cache_name, DEFAULT_ASSET_CACHE_NAME);
    }

    #[test]
    fn test_validate_rejects_seeding_without_dir() {
        let config = CacheConfig {
            preload_assets: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }
}
