//! On-disk configuration for the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use musichub_auth::AuthConfig;
use musichub_sync::{SchedulerConfig, SyncConfig};

pub const CONFIG_FILE: &str = "config.json";
pub const API_URL_ENV: &str = "MUSICHUB_API_URL";
pub const DEFAULT_API_URL: &str = "https://api.musichub.app";

/// Everything the core needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub api_url: String,
    /// URL probed for connectivity. Defaults to the API URL.
    pub probe_url: Option<String>,
    pub request_timeout_secs: u64,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            probe_url: None,
            request_timeout_secs: 30,
            auth: AuthConfig::default(),
            sync: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Read `<data_dir>/config.json`, or use defaults when it does not exist.
    /// `MUSICHUB_API_URL` overrides the API URL either way.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                config.api_url = url.trim().to_string();
            }
        }
        Ok(config)
    }

    pub fn probe_url(&self) -> &str {
        self.probe_url.as_deref().unwrap_or(&self.api_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `--data-dir`, or the platform data directory.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => dirs::data_dir()
            .map(|dir| dir.join("musichub"))
            .context("Could not determine a data directory; pass --data-dir"),
    }
}
