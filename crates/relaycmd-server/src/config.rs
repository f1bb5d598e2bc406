//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use relaycmd_core::{RelayError, RelayResult, MAX_FRAME_BYTES};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    /// Messages kept per offline user.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            queue_limit: default_queue_limit(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// One `[[users]]` entry: an identity and the SHA-256 of its bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserEntry {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Lowercase hex SHA-256 of the token.
    pub token_sha256: String,
    /// Extra identities this token may pin with `registerAs`.
    #[serde(default)]
    pub actors: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_queue_limit() -> usize {
    100
}
fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub queue_limit: usize,
    pub max_frame_bytes: usize,
    pub users: Vec<UserEntry>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_queue_limit: Option<usize>,
    ) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        for user in &file_config.users {
            if user.user_id.trim().is_empty() {
                return Err(RelayError::Config("user entry with empty user_id".into()));
            }
            if user.token_sha256.len() != 64 || hex::decode(&user.token_sha256).is_err() {
                return Err(RelayError::Config(format!(
                    "user {}: token_sha256 must be 64 hex characters",
                    user.user_id
                )));
            }
        }

        Ok(Self {
            bind: cli_bind
                .map(str::to_string)
                .unwrap_or(file_config.server.bind),
            port: cli_port.unwrap_or(file_config.server.port),
            queue_limit: cli_queue_limit.unwrap_or(file_config.relay.queue_limit),
            max_frame_bytes: file_config.relay.max_frame_bytes,
            users: file_config.users,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(Some(Path::new("/nonexistent/relay.toml")), None, None, None)
            .unwrap();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.queue_limit, 100);
        assert_eq!(cfg.max_frame_bytes, MAX_FRAME_BYTES);
        assert!(cfg.users.is_empty());
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = write_config(&format!(
            r#"
[server]
bind = "127.0.0.1"
port = 9000

[relay]
queue_limit = 5
max_frame_bytes = 4096

[[users]]
user_id = "u1"
username = "alice"
phone = "+100"
token_sha256 = "{DIGEST}"
actors = ["u1-kiosk"]
"#
        ));

        let cfg = ServerConfig::load(Some(file.path()), None, Some(9100), None).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.queue_limit, 5);
        assert_eq!(cfg.max_frame_bytes, 4096);
        assert_eq!(cfg.users.len(), 1);
        assert_eq!(cfg.users[0].username.as_deref(), Some("alice"));
        assert_eq!(cfg.users[0].actors, vec!["u1-kiosk".to_string()]);
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9100");
    }

    #[test]
    fn bad_digest_rejected() {
        let file = write_config(
            r#"
[[users]]
user_id = "u1"
token_sha256 = "not-a-digest"
"#,
        );
        let err = ServerConfig::load(Some(file.path()), None, None, None).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn malformed_toml_rejected() {
        let file = write_config("[server\nport = ");
        assert!(ServerConfig::load(Some(file.path()), None, None, None).is_err());
    }

    #[test]
    fn tilde_expansion() {
        let home = dirs::home_dir();
        let expanded = expand_tilde_str("~/relay.toml");
        match home {
            Some(home) => assert_eq!(expanded, home.join("relay.toml")),
            None => assert_eq!(expanded, PathBuf::from("~/relay.toml")),
        }
        assert_eq!(expand_tilde_str("/etc/relay.toml"), PathBuf::from("/etc/relay.toml"));
    }
}
