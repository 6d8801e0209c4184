//! Client configuration: API and realtime addresses, identity provider settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::token::DEFAULT_EXPIRY_THRESHOLD_SECS;

pub const API_URL_ENV: &str = "SESSIONLINK_API_URL";
pub const WS_URL_ENV: &str = "SESSIONLINK_WS_URL";

const DEFAULT_API_URL: &str = "http://localhost:3000/api";
const DEFAULT_EXPIRY_POLL_SECS: u64 = 15;

/// Identity provider registration for this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub client_id: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub redirect_uri: String,
    pub scope: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            client_id: "sessionlink".to_string(),
            authorize_endpoint: "http://localhost:9000/oauth/authorize".to_string(),
            token_endpoint: "http://localhost:9000/oauth/token".to_string(),
            redirect_uri: "http://127.0.0.1:8765/callback".to_string(),
            scope: "openid profile".to_string(),
        }
    }
}

/// Settings for the session manager and realtime channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base address of the HTTP API, e.g. `https://host/api`
    pub api_url: String,
    /// Explicit realtime endpoint; derived from `api_url` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    pub provider: ProviderConfig,
    pub expiry_threshold_secs: i64,
    pub expiry_poll_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: None,
            provider: ProviderConfig::default(),
            expiry_threshold_secs: DEFAULT_EXPIRY_THRESHOLD_SECS,
            expiry_poll_secs: DEFAULT_EXPIRY_POLL_SECS,
        }
    }
}

impl Config {
    /// Apply command line / environment overrides
    pub fn with_overrides(mut self, api_url: Option<String>, ws_url: Option<String>) -> Self {
        if let Some(api_url) = api_url.filter(|v| !v.trim().is_empty()) {
            self.api_url = api_url;
        }
        if let Some(ws_url) = ws_url.filter(|v| !v.trim().is_empty()) {
            self.ws_url = Some(ws_url);
        }
        self
    }
}

/// Get the path to the configuration file
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Cannot determine config directory")?;
    Ok(config_dir.join("sessionlink").join("config.json"))
}

/// Load configuration from `path`, defaults when the file does not exist
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    Ok(config)
}

/// Load the configuration from the default location
pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Save the configuration to `path`
pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let data = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, data).context("Failed to write config file")?;
    Ok(())
}
