//! Configuration loader
//!
//! Loads cloud.cfg and its drop-ins from the standard locations.

use super::{DatasourceConfig, SystemConfig};
use crate::CloudInitError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Cloud configuration directory
pub const CONFIG_DIR: &str = "/etc/cloud";

/// Locations of the system configuration
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Config directory (default: /etc/cloud)
    pub config: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPaths {
    pub fn new() -> Self {
        Self {
            config: PathBuf::from(CONFIG_DIR),
        }
    }

    /// Use a different config directory (useful for testing)
    pub fn with_config_dir(config: impl AsRef<Path>) -> Self {
        Self {
            config: config.as_ref().to_path_buf(),
        }
    }

    /// /etc/cloud/cloud.cfg
    pub fn main_config(&self) -> PathBuf {
        self.config.join("cloud.cfg")
    }

    /// /etc/cloud/cloud.cfg.d
    pub fn config_d(&self) -> PathBuf {
        self.config.join("cloud.cfg.d")
    }
}

/// Load the datasource settings from cloud.cfg and cloud.cfg.d/*.cfg
pub async fn load_datasource_config(paths: &ConfigPaths) -> Result<DatasourceConfig, CloudInitError> {
    let mut merged = DatasourceConfig::default();

    if let Some(config) = load_config_file(paths.main_config()).await? {
        debug!("Loaded base config from {}", paths.main_config().display());
        merged.merge(config.datasource);
    }

    for config in load_dropin_configs(paths.config_d()).await? {
        merged.merge(config.datasource);
    }

    Ok(merged)
}

/// Load a single config file; missing or unparseable files yield `None`
async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<SystemConfig>, CloudInitError> {
    let path = path.as_ref();

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_yaml::from_str::<SystemConfig>(&content) {
        Ok(config) => Ok(Some(config)),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Load all drop-in configs from a directory (sorted alphabetically)
async fn load_dropin_configs(dir: impl AsRef<Path>) -> Result<Vec<SystemConfig>, CloudInitError> {
    let dir = dir.as_ref();

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }
    entries.sort();

    let mut configs = Vec::new();
    for path in entries {
        if let Some(config) = load_config_file(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            configs.push(config);
        }
    }

    info!("Loaded {} drop-in configs", configs.len());
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_config_file_not_exists() {
        let result = load_config_file("/nonexistent/path").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_file_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cloud.cfg");
        fs::write(&path, "datasource: [unterminated").await.unwrap();

        assert!(load_config_file(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropins_override_in_order() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_config_dir(temp.path());
        let dir = paths.config_d();
        fs::create_dir_all(&dir).await.unwrap();

        fs::write(
            paths.main_config(),
            "datasource:\n  Ec2:\n    max_wait: 10\n  Azure:\n    imds_url: http://base\n",
        )
        .await
        .unwrap();
        fs::write(dir.join("90-late.cfg"), "datasource:\n  Ec2:\n    max_wait: 90\n")
            .await
            .unwrap();
        fs::write(dir.join("10-early.cfg"), "datasource:\n  Ec2:\n    max_wait: 20\n")
            .await
            .unwrap();
        // Non-cfg file should be ignored
        fs::write(dir.join("ignored.txt"), "datasource:\n  Ec2:\n    max_wait: 1\n")
            .await
            .unwrap();

        let config = load_datasource_config(&paths).await.unwrap();
        assert_eq!(config.ec2().max_wait, 90.0);
        assert_eq!(config.azure().imds_url, "http://base");
    }

    #[test]
    fn test_missing_directory_gives_defaults() {
        let paths = ConfigPaths::with_config_dir("/nonexistent/cloud");
        let config = tokio_test::assert_ok!(tokio_test::block_on(load_datasource_config(&paths)));
        assert_eq!(config, DatasourceConfig::default());
    }
}
