use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub matcher: MatcherConfig,
    pub trigger: TriggerConfig,
    pub delivery: DeliveryConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Base URL of the chat-completions API used to resolve spoken commands.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_seconds: u64,
    /// Attempts before a window is given up on. Schema-invalid responses
    /// count as failed attempts.
    pub max_attempts: u32,
    pub retry_pause_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// How far back (seconds) the wake-word scan looks when a word batch arrives.
    pub lookback_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Total delivery attempts per webhook event (1 initial + retries).
    pub max_attempts: u32,
    /// Backoff base in milliseconds; each retry doubles it, with jitter.
    pub base_delay_ms: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Meeting-bot provider API. Only used for in-meeting acknowledgement
    /// messages; transcript callbacks arrive on our own HTTP server.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub ack_messages: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3790 }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            request_timeout_seconds: 30,
            max_attempts: 3,
            retry_pause_seconds: 1,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            lookback_seconds: 30.0,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            request_timeout_seconds: 30,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://us-west-2.recall.ai/api/v1".to_string(),
            api_key: None,
            ack_messages: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
