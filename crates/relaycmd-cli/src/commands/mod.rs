//! CLI subcommand implementations.

pub mod listen;
pub mod send;

use anyhow::{Context, Result};
use relaycmd_client::{Channel, ChannelConfig, CredentialProvider, EnvToken, WebSocketConnector};

/// Connection settings after applying CLI overrides to the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub identity: Option<String>,
    pub token_env: String,
}

/// Build a channel for `settings`. Fails early when the token variable is unset.
pub fn open_channel(settings: &Settings) -> Result<Channel<WebSocketConnector>> {
    let credentials = EnvToken::new(settings.token_env.clone());
    if credentials.token().is_none() {
        anyhow::bail!("no bearer token: set ${}", settings.token_env);
    }

    let connector = WebSocketConnector::new(settings.url.clone())
        .with_context(|| format!("invalid relay URL {}", settings.url))?;
    Ok(Channel::new(connector, credentials, ChannelConfig::default()))
}
