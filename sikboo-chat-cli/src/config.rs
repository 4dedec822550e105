//! Client Configuration
//!
//! TOML configuration for the chat client, stored at
//! `$XDG_CONFIG_HOME/sikboo-chat/client.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sikboo_chat_protocol::{CacheConfig, ConnectionConfig, HistoryConfig, RoomConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `server.base_url`
pub const BASE_URL_ENV: &str = "SIKBOO_API_BASE_URL";

/// Overrides `server.auth_token`
pub const AUTH_TOKEN_ENV: &str = "SIKBOO_AUTH_TOKEN";

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Backend endpoints
    #[serde(default)]
    pub server: ServerConfig,

    /// Chat behaviour
    #[serde(default)]
    pub chat: ChatConfig,

    /// Message cache limits
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Backend endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP base URL, the WebSocket URL is derived from it
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// REST API prefix
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// STOMP WebSocket endpoint path
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Chat behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Member ID used when sending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<i64>,

    /// History page size
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// STOMP heart-beat in seconds (0 disables)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Message cache limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Conversations kept in memory
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,

    /// Seconds an unobserved conversation is kept
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_prefix() -> String {
    sikboo_chat_protocol::history::DEFAULT_API_PREFIX.to_string()
}

fn default_ws_path() -> String {
    sikboo_chat_protocol::connection::DEFAULT_WS_PATH.to_string()
}

fn default_page_size() -> usize {
    sikboo_chat_protocol::history::DEFAULT_PAGE_SIZE
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    sikboo_chat_protocol::connection::DEFAULT_HEARTBEAT.as_secs()
}

fn default_max_conversations() -> usize {
    sikboo_chat_protocol::cache::DEFAULT_MAX_CONVERSATIONS
}

fn default_idle_ttl_secs() -> u64 {
    sikboo_chat_protocol::cache::DEFAULT_IDLE_TTL.as_secs()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
            ws_path: default_ws_path(),
            auth_token: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            member_id: None,
            page_size: default_page_size(),
            connect_timeout_secs: default_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_conversations: default_max_conversations(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("sikboo-chat")
            .join("client.toml")
    }

    /// Load configuration, creating the default file if not found
    ///
    /// Environment overrides are applied after the file is read and are
    /// never written back.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(
            std::env::var(BASE_URL_ENV).ok(),
            std::env::var(AUTH_TOKEN_ENV).ok(),
        );
        Ok(config)
    }

    /// Load configuration from `path`, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    fn apply_overrides(&mut self, base_url: Option<String>, auth_token: Option<String>) {
        if let Some(url) = base_url.filter(|url| !url.trim().is_empty()) {
            self.server.base_url = url.trim().to_string();
        }
        if let Some(token) = auth_token.filter(|token| !token.trim().is_empty()) {
            self.server.auth_token = Some(token.trim().to_string());
        }
    }

    /// Copy with the auth token masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.server.auth_token.is_some() {
            config.server.auth_token = Some("********".to_string());
        }
        config
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            base_url: self.server.base_url.clone(),
            ws_path: self.server.ws_path.clone(),
            host: None,
            auth_token: self.server.auth_token.clone(),
            connect_timeout: self.connect_timeout(),
            heartbeat: Duration::from_secs(self.chat.heartbeat_secs),
        }
    }

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            base_url: self.server.base_url.clone(),
            api_prefix: self.server.api_prefix.clone(),
            auth_token: self.server.auth_token.clone(),
            request_timeout: Duration::from_secs(self.chat.request_timeout_secs),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_conversations: self.cache.max_conversations.max(1),
            idle_ttl: Duration::from_secs(self.cache.idle_ttl_secs),
        }
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            page_size: self.chat.page_size.max(1),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.chat.connect_timeout_secs)
    }
}
