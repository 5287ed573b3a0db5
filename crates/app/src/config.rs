//! App configuration.
//!
//! Stored as JSON. Every field is optional; missing fields take their
//! defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use vaultsync_background::BackgroundConfig;
use vaultsync_transfer::DispatcherConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// JSON snapshot of the record store. `None` keeps records in memory.
    pub store_path: Option<PathBuf>,
    pub active_account: Option<String>,
    /// Cancel active transfers when the app resigns active.
    pub cancel_on_resign_active: bool,
    pub dispatcher: DispatcherConfig,
    pub background: BackgroundConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            active_account: None,
            cancel_on_resign_active: true,
            dispatcher: DispatcherConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but falls back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Writes the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}
