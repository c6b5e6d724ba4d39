use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use utils::assets::config_path;
use workflow::OrchestratorConfig;

pub const CONFIG_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// OpenAI-compatible chat completions endpoint used by the agent invoker.
#[derive(Clone, Debug, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Read from `OPENAI_API_KEY`, never written to disk
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "gpt-oss".to_string(),
            temperature: 0.2,
            max_tokens: 600,
            api_key: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct Config {
    pub config_version: String,
    /// Per-step invocation deadline; `null` disables it
    pub step_timeout_secs: Option<u64>,
    /// Capacity of the in-process event bus
    pub event_buffer: usize,
    /// Per-connection buffer of SSE and WebSocket subscribers
    pub sink_buffer: usize,
    /// Poll interval of the status stream
    pub status_poll_interval_ms: u64,
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION.to_string(),
            step_timeout_secs: Some(300),
            event_buffer: 1024,
            sink_buffer: 256,
            status_poll_interval_ms: 1000,
            llm: LlmConfig::default(),
        }
    }
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        match serde_json::from_str::<Config>(&raw_config) {
            Ok(config) if config.config_version == CONFIG_VERSION => config,
            Ok(config) => {
                tracing::warn!(
                    "Unknown config version {}, using defaults",
                    config.config_version
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to parse config: {}, using defaults", e);
                Self::default()
            }
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "event_buffer must be greater than zero".into(),
            ));
        }
        if self.sink_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "sink_buffer must be greater than zero".into(),
            ));
        }
        if self.status_poll_interval_ms < 100 {
            return Err(ConfigError::ValidationError(
                "status_poll_interval_ms must be at least 100".into(),
            ));
        }
        if self.step_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "step_timeout_secs must be positive or null".into(),
            ));
        }
        Ok(())
    }

    /// Apply overrides from a variable lookup. `FINSIGHT_STEP_TIMEOUT_SECS=0`
    /// disables the step deadline.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("FINSIGHT_STEP_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(0) => self.step_timeout_secs = None,
                Ok(secs) => self.step_timeout_secs = Some(secs),
                Err(_) => tracing::warn!("Ignoring invalid FINSIGHT_STEP_TIMEOUT_SECS={}", raw),
            }
        }
        if let Some(endpoint) = lookup("LLM_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            self.llm.endpoint = endpoint;
        }
        if let Some(model) = lookup("LLM_MODEL").filter(|v| !v.trim().is_empty()) {
            self.llm.model = model;
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            step_timeout: self.step_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

/// Always returns a config, falling back to defaults when the file is missing or unreadable
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw_config) => Config::from(raw_config),
        Err(_) => {
            tracing::info!("No config file found, creating one");
            Config::default()
        }
    }
}

pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let raw_config = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}

/// Load `config.json` from the asset directory, write it back when it did
/// not exist yet, then apply environment overrides.
pub async fn load_or_init() -> Result<Config, ConfigError> {
    let path = config_path();
    let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
    let mut config = load_config_from_file(&path).await;
    if !existed {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        save_config_to_file(&config, &path).await?;
    }
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
