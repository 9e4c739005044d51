use crate::conversation::{RetryPolicy, StoreOptions};
use crate::gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend origin, e.g. `https://api.example.com`.
    pub base_url: String,
    pub chat_path: String,
    /// `{id}` is replaced by the conversation id.
    pub history_path: String,
    pub conversations_path: String,
    pub refresh_path: String,

    /// Identical messages closer together than this are one message.
    pub dedup_window_ms: u64,
    /// Unresolved in-flight requests are evicted after this long.
    pub inflight_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,

    /// How long completed authorizations stay visible.
    pub authorization_expiry_ms: u64,
    /// Keep system and feedback messages internally.
    pub retain_hidden_messages: bool,

    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("tether"))
            .unwrap_or_else(|| PathBuf::from(".tether"));
        let store = StoreOptions::default();

        Self {
            base_url: "http://localhost:8000".to_string(),
            chat_path: store.chat_path,
            history_path: store.history_path,
            conversations_path: store.conversations_path,
            refresh_path: GatewayConfig::default().refresh_path,
            dedup_window_ms: 5000,
            inflight_ttl_secs: 30,
            request_timeout_secs: 60,
            retry: RetryPolicy::default(),
            authorization_expiry_ms: 3000,
            retain_hidden_messages: false,
            data_dir,
        }
    }
}

impl Config {
    /// Path to the stored session tokens.
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("auth.json")
    }

    /// Path to the workflow plan cache.
    pub fn workflow_db_path(&self) -> PathBuf {
        self.data_dir.join("workflow.db")
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("tether").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".tether/config.toml"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.base_url.clone(),
            refresh_path: self.refresh_path.clone(),
            inflight_ttl: Duration::from_secs(self.inflight_ttl_secs),
        }
    }

    pub fn store(&self) -> StoreOptions {
        StoreOptions {
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            retain_hidden: self.retain_hidden_messages,
            retry: self.retry.clone(),
            chat_path: self.chat_path.clone(),
            history_path: self.history_path.clone(),
            conversations_path: self.conversations_path.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn authorization_expiry(&self) -> Duration {
        Duration::from_millis(self.authorization_expiry_ms)
    }
}
