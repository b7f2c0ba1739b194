use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub folders: Vec<SyncFolder>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base server URL, e.g. `https://cloud.example.com`
    pub url: String,
    pub username: String,
    /// App password / token; basic auth on every request.
    pub password: String,
    /// "nextcloud", "owncloud" or "generic" [default: nextcloud]
    pub flavor: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_full_sync_interval")]
    pub full_sync_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Custom database location [default: ~/.local/share/davsyncd/sync.db]
    pub db_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            full_sync_interval_secs: default_full_sync_interval(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            db_path: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_full_sync_interval() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

/// One remote folder to keep reconciled.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncFolder {
    pub remote_path: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub sync_data: bool,
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("davsyncd").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\
             Create it with your server URL and an app password.",
            path.display()
        )
    })?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if config.server.url.is_empty() {
        anyhow::bail!("server.url must not be empty");
    }
    if !config.server.url.starts_with("http://") && !config.server.url.starts_with("https://") {
        anyhow::bail!("server.url must start with http:// or https://");
    }
    if config.server.username.is_empty() {
        anyhow::bail!("server.username must not be empty");
    }
    if config.folders.is_empty() {
        anyhow::bail!("at least one [[folders]] entry is required");
    }

    Ok(config)
}
