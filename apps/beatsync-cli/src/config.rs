//! Client configuration.
//!
//! Stored as TOML:
//! - Linux: `$XDG_CONFIG_HOME/beatsync/config.toml` (`~/.config` fallback)
//! - Windows: `%APPDATA%/beatsync/config.toml`

use std::path::{Path, PathBuf};

use beatsync_engine::SyncConfig;
use beatsync_http::HttpConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Directory holding persisted transfer state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_state_dir() -> PathBuf {
    config_dir()
        .map(|d| d.join("beatsync").join("state"))
        .unwrap_or_else(|| std::env::temp_dir().join("beatsync").join("state"))
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            http: HttpConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl CliConfig {
    /// Loads configuration from `path` (or the default location), writing a
    /// default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: CliConfig = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = CliConfig::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    config_dir()
        .map(|d| d.join("beatsync").join("config.toml"))
        .ok_or_else(|| anyhow::anyhow!("cannot determine the configuration directory"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
