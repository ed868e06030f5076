//! Configuration for the bridge.
//!
//! Loaded once at startup from a TOML file, with environment variable
//! overrides for secrets and the bind address. Every section has serde
//! defaults so a minimal config only needs the Lark credentials and the
//! inference endpoint.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file path.
pub const CONFIG_PATH_ENV: &str = "LARK_BRIDGE_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server (webhook ingress) settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Feishu/Lark app settings
    #[serde(default)]
    pub lark: LarkConfig,

    /// Inference service settings
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Bridge behavior (caches, working-notice delay)
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Webhook server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4470
}

/// Feishu/Lark app configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LarkConfig {
    pub app_id: String,
    pub app_secret: String,
    /// AES key for encrypted event callbacks (optional)
    #[serde(default)]
    pub encrypt_key: Option<String>,
    /// Verification token checked against event headers (optional)
    #[serde(default)]
    pub verification_token: Option<String>,
    /// Allowed sender open_ids. Use "*" to allow everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Use the Lark (international) API host instead of Feishu (China)
    #[serde(default)]
    pub use_lark: bool,
}

/// Inference service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Full endpoint URL, e.g. "http://10.0.0.1:5001/v1/chat-messages"
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

fn default_inference_timeout_secs() -> u64 {
    120
}

/// Bridge behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Dedup cache: max tracked message ids
    #[serde(default = "default_cache_capacity")]
    pub dedup_capacity: usize,
    /// Dedup cache: seconds before a message id may be reprocessed
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Conversation cache: max tracked users
    #[serde(default = "default_cache_capacity")]
    pub conversation_capacity: usize,
    /// Conversation cache: seconds before a user's session token expires
    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,
    /// Seconds to wait before sending the interim "working" notice
    #[serde(default = "default_notice_delay_secs")]
    pub notice_delay_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: default_cache_capacity(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            conversation_capacity: default_cache_capacity(),
            conversation_ttl_secs: default_conversation_ttl_secs(),
            notice_delay_secs: default_notice_delay_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_dedup_ttl_secs() -> u64 {
    3600
}

fn default_conversation_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_notice_delay_secs() -> u64 {
    5
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Config {
    /// Load configuration from the default path with env overrides applied.
    ///
    /// The path comes from `LARK_BRIDGE_CONFIG`, falling back to
    /// `./config.toml`. A missing file yields the defaults so that a
    /// fully env-configured deployment needs no file at all.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::info!("Config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(app_id) = std::env::var("LARK_APP_ID") {
            self.lark.app_id = app_id;
        }
        if let Ok(app_secret) = std::env::var("LARK_APP_SECRET") {
            self.lark.app_secret = app_secret;
        }
        if let Ok(key) = std::env::var("LARK_ENCRYPT_KEY") {
            self.lark.encrypt_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("INFERENCE_ENDPOINT") {
            self.inference.endpoint = endpoint;
        }
        if let Ok(api_key) = std::env::var("INFERENCE_API_KEY") {
            self.inference.api_key = api_key;
        }
        if let Ok(port) = std::env::var("LARK_BRIDGE_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(level) = std::env::var("LARK_BRIDGE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Validate that the required settings are present.
    pub fn validate(&self) -> Result<()> {
        if self.lark.app_id.is_empty() || self.lark.app_secret.is_empty() {
            anyhow::bail!("Missing Lark credentials (lark.app_id / lark.app_secret)");
        }
        if self.inference.endpoint.is_empty() {
            anyhow::bail!("Missing inference endpoint (inference.endpoint)");
        }
        if self.inference.api_key.is_empty() {
            anyhow::bail!("Missing inference API key (inference.api_key)");
        }
        Ok(())
    }
}
