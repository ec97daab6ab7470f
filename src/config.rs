use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between periodic sync cycles
    pub sync_interval_secs: u64,
    /// Maximum random jitter (seconds) added to each cycle interval
    pub interval_jitter_secs: u64,
    /// Transient failures tolerated per entry before giving up
    pub max_retries: u32,
    /// Watch-progress records retained per user; least-recently-updated
    /// entries beyond this are evicted on insert
    pub history_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
            interval_jitter_secs: 5,
            max_retries: 3,
            history_cap: 100,
        }
    }
}

impl SyncConfig {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("shiori");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists.
    /// A corrupt file falls back to defaults rather than failing startup.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config = match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse config file, using defaults: {e}");
                    SyncConfig::default()
                }
            };

            Ok(config)
        } else {
            let config = SyncConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}
