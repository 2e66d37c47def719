use std::{
    error::Error,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

const CONFIG_FILE_NAME: &str = "updater.json";

/// Tunables of the update pipeline, stored as `updater.json` in the app directory.
///
/// User preferences (theme, refresh interval) are not part of this file, they live in the
/// [`StatusStore`](crate::StatusStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Where finished packages are kept. Empty means `<app_dir>/downloads`.
    pub downloads_dir: PathBuf,
    /// Where in-progress `.part` files live. Empty means `<app_dir>/cache`.
    pub cache_dir: PathBuf,
    /// Minimum battery percentage required to apply an update while unplugged.
    pub min_battery_level: u8,
    pub battery_poll_interval_secs: u64,
    pub dumpsys_path: String,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_download_attempts: u32,
    pub storage_low_threshold_mb: u64,
    pub constraint_poll_interval_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::new(),
            cache_dir: PathBuf::new(),
            min_battery_level: 30,
            battery_poll_interval_secs: 30,
            dumpsys_path: "dumpsys".to_string(),
            min_backoff_secs: 10,
            max_backoff_secs: 5 * 60 * 60,
            max_download_attempts: 10,
            storage_low_threshold_mb: 512,
            constraint_poll_interval_secs: 15,
        }
    }
}

impl UpdaterConfig {
    /// Loads the config from `app_dir`, writing defaults if the file doesn't exist.
    ///
    /// A file that can't be parsed is logged and replaced by defaults in memory only, so a
    /// hand-edited config isn't silently overwritten.
    #[instrument(skip(app_dir))]
    pub fn load(app_dir: &Path) -> Self {
        let path = app_dir.join(CONFIG_FILE_NAME);
        let config = if path.exists() {
            match Self::read(&path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        error = e.as_ref() as &dyn Error,
                        path = %path.display(),
                        "Failed to load updater config, using defaults"
                    );
                    Self::default()
                }
            }
        } else {
            info!(path = %path.display(), "Updater config doesn't exist, writing defaults");
            let config = Self::default();
            if let Err(e) = config.save(&path) {
                warn!(error = e.as_ref() as &dyn Error, "Failed to write default updater config");
            }
            config
        };
        config.resolve_dirs(app_dir)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path).context("Failed to read updater config")?;
        let config = serde_json::from_str(&content).context("Failed to parse updater config")?;
        debug!(?config, "Loaded updater config");
        Ok(config)
    }

    #[instrument(skip(self), err)]
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize updater config")?;
        fs_err::write(path, json).context("Failed to write updater config")?;
        Ok(())
    }

    /// Fills empty directory settings with their defaults under `app_dir`.
    pub fn resolve_dirs(mut self, app_dir: &Path) -> Self {
        if self.downloads_dir.as_os_str().is_empty() {
            self.downloads_dir = app_dir.join("downloads");
        }
        if self.cache_dir.as_os_str().is_empty() {
            self.cache_dir = app_dir.join("cache");
        }
        self
    }

    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_interval_secs.max(1))
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_secs(self.min_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(self.min_backoff_secs))
    }

    pub fn constraint_poll_interval(&self) -> Duration {
        Duration::from_secs(self.constraint_poll_interval_secs.max(1))
    }

    pub fn storage_low_threshold_bytes(&self) -> u64 {
        self.storage_low_threshold_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use test_log::test;

    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::load(dir.path());

        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(config.min_battery_level, 30);
        assert_eq!(config.downloads_dir, dir.path().join("downloads"));
        assert_eq!(config.cache_dir, dir.path().join("cache"));
        assert_eq!(config.min_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "min_battery_level": 50, "cache_dir": "/data/ota/cache" }"#,
        )
        .unwrap();

        let config = UpdaterConfig::load(dir.path());
        assert_eq!(config.min_battery_level, 50);
        assert_eq!(config.cache_dir, PathBuf::from("/data/ota/cache"));
        assert_eq!(config.max_download_attempts, 10);
    }

    #[test]
    fn corrupt_file_falls_back_without_overwriting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ broken").unwrap();

        let config = UpdaterConfig::load(dir.path());
        assert_eq!(config.dumpsys_path, "dumpsys");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ broken");
    }
}
