//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PWA_CHAT_HOST`, `PWA_CHAT_PORT`,
//!    `PWA_CHAT_ENABLED`, `GATEWAY_AUTH_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `pwa-chat.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [channels.pwa-chat]
//! enabled = true
//! host = "127.0.0.1"
//! port = 19999
//!
//! [gateway.auth]
//! token = "your-secret-token"
//!
//! [storage]
//! data_dir = "/home/user/.openclaw"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::RelayError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(rename = "pwa-chat", default)]
    pub pwa_chat: PwaChatConfig,
}

/// The relay's own bind settings (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct PwaChatConfig {
    /// Whether the relay runs at all (default true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bind address (default loopback-v4).
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (default 19999).
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for PwaChatConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Shared-secret gate for non-loopback, non-trusted-proxy clients (spec
/// §4.7).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token. Absent = no secret required beyond loopback/proxy
    /// checks. Override with `GATEWAY_AUTH_TOKEN` env var.
    pub token: Option<String>,
}

/// Where history and push state are persisted on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for `pwa-chat-history/` and `pwa-chat-push/` (default
    /// `$HOME/.openclaw`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    19999
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{home}/.openclaw"),
        Err(_) => ".openclaw".to_string(),
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults. If `path` is `Some`, reads that file. Otherwise looks for
    /// `pwa-chat.toml` in the current directory, falling back to compiled
    /// defaults. Fails loudly on an unreadable/malformed config file or an
    /// invalid bind address — both surface up to the caller (spec §7).
    pub fn load(path: Option<&str>) -> Result<Self, RelayError> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| RelayError::Config(format!("failed to read {p}: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("failed to parse {p}: {e}")))?
        } else if Path::new("pwa-chat.toml").exists() {
            let content = std::fs::read_to_string("pwa-chat.toml")
                .map_err(|e| RelayError::Config(format!("failed to read pwa-chat.toml: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("failed to parse pwa-chat.toml: {e}")))?
        } else {
            Config {
                channels: ChannelsConfig::default(),
                gateway: GatewayConfig::default(),
                storage: StorageConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        if let Ok(host) = std::env::var("PWA_CHAT_HOST") {
            config.channels.pwa_chat.host = host;
        }
        if let Ok(port) = std::env::var("PWA_CHAT_PORT") {
            config.channels.pwa_chat.port = port
                .parse()
                .map_err(|_| RelayError::Config(format!("invalid PWA_CHAT_PORT: {port}")))?;
        }
        if let Ok(enabled) = std::env::var("PWA_CHAT_ENABLED") {
            config.channels.pwa_chat.enabled = enabled
                .parse()
                .map_err(|_| RelayError::Config(format!("invalid PWA_CHAT_ENABLED: {enabled}")))?;
        }
        if let Ok(token) = std::env::var("GATEWAY_AUTH_TOKEN") {
            config.gateway.auth.token = Some(token);
        }

        if config.channels.pwa_chat.host.parse::<std::net::IpAddr>().is_err() {
            return Err(RelayError::Config(format!(
                "invalid host: {}",
                config.channels.pwa_chat.host
            )));
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.channels.pwa_chat.host, self.channels.pwa_chat.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_to_loopback_on_configured_port() {
        let config = Config {
            channels: ChannelsConfig::default(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:19999");
    }

    #[test]
    fn parses_full_toml_document() {
        let toml = r#"
            [channels.pwa-chat]
            enabled = false
            host = "0.0.0.0"
            port = 8080

            [gateway.auth]
            token = "secret"

            [storage]
            data_dir = "/tmp/openclaw"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.channels.pwa_chat.enabled);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.gateway.auth.token.as_deref(), Some("secret"));
        assert_eq!(config.storage.data_dir, "/tmp/openclaw");
    }
}
