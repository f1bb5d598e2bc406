//! Client configuration at `~/.relaycmd/config.toml`.
//!
//! Provides the default relay URL, pinned identity, and the environment
//! variable holding the bearer token. CLI flags always override config file
//! values.

use anyhow::{Context, Result};
use relaycmd_client::config::DEFAULT_URL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Token variable used when the config names none.
pub const DEFAULT_TOKEN_ENV: &str = "RELAYCMD_TOKEN";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Relay WebSocket URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Identity to pin with `registerAs` (empty = the token's own user).
    #[serde(default)]
    pub identity: String,

    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            identity: String::new(),
            token_env: default_token_env(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// `~/.relaycmd/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".relaycmd")
            .join("config.toml")
    }

    /// Pinned identity, if one is configured.
    pub fn identity(&self) -> Option<String> {
        let identity = self.default.identity.trim();
        (!identity.is_empty()).then(|| identity.to_string())
    }
}
