use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::error::ConfabError;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl From<ConfigLoadError> for ConfabError {
    fn from(err: ConfigLoadError) -> Self {
        match err {
            ConfigLoadError::Config(e) => e.into(),
            ConfigLoadError::InvalidValue { key, message } => {
                ConfabError::InvalidConfigValue { key, message }
            }
            ConfigLoadError::Render(e) => ConfabError::SerializationError(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfabConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Echo every routed message to stdout.
    #[serde(default)]
    pub console: bool,

    /// Append-only transcript file; empty disables it.
    #[serde(default)]
    pub transcript_path: String,

    #[serde(default)]
    pub transcript_format: TranscriptFormat,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Zero means three heartbeat intervals.
    #[serde(default)]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_outbound_queue")]
    pub outbound_queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptFormat {
    #[default]
    Json,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerModeConfig {
    Reactive,
    #[default]
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    #[serde(default)]
    pub mode: TriggerModeConfig,

    #[serde(default = "default_processing_interval")]
    pub processing_interval_secs: u64,

    #[serde(default = "default_recent_window")]
    pub recent_window: usize,

    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    #[serde(default = "default_capability_timeout")]
    pub capability_timeout_secs: u64,

    /// Fixed pause before each capability call, to stay under provider rate limits.
    #[serde(default)]
    pub call_delay_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default)]
    pub responder_url: String,

    #[serde(default)]
    pub arbiter_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub instruction_file: String,

    #[serde(default)]
    pub moderator_instruction_file: String,

    /// Non-empty switches arbitration to moderated next-speaker mode.
    #[serde(default)]
    pub speakers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    #[serde(default = "default_client_host")]
    pub host: String,

    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_send_timeout() -> u64 {
    10
}

fn default_delivery_timeout() -> u64 {
    5000
}

fn default_outbound_queue() -> usize {
    64
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:9999".to_string()
}

fn default_processing_interval() -> u64 {
    30
}

fn default_recent_window() -> usize {
    10
}

fn default_history_cap() -> usize {
    500
}

fn default_capability_timeout() -> u64 {
    60
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_client_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            console: false,
            transcript_path: String::new(),
            transcript_format: TranscriptFormat::default(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            idle_timeout_secs: 0,
            send_timeout_secs: default_send_timeout(),
            delivery_timeout_ms: default_delivery_timeout(),
            outbound_queue_size: default_outbound_queue(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            mode: TriggerModeConfig::default(),
            processing_interval_secs: default_processing_interval(),
            recent_window: default_recent_window(),
            history_cap: default_history_cap(),
            capability_timeout_secs: default_capability_timeout(),
            call_delay_ms: 0,
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
            responder_url: String::new(),
            arbiter_url: String::new(),
            api_key: None,
            instruction_file: String::new(),
            moderator_instruction_file: String::new(),
            speakers: Vec::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            host: default_client_host(),
            port: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl HubConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        if self.idle_timeout_secs == 0 {
            self.heartbeat_interval() * 3
        } else {
            Duration::from_secs(self.idle_timeout_secs)
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn transcript_path(&self) -> Option<PathBuf> {
        if self.transcript_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.transcript_path))
        }
    }
}

impl AgentConfig {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_secs(self.processing_interval_secs)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl ConfabConfig {
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from_paths(get_config_paths())
    }

    pub fn load_from_paths(paths: Vec<PathBuf>) -> Result<Self, ConfigLoadError> {
        load_dotenv_files();

        let mut builder = ConfigBuilder::builder();

        for path in paths {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CONFAB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut confab_config: ConfabConfig = config.try_deserialize()?;

        if let Ok(level) = std::env::var("CONFAB_LOG_LEVEL") {
            confab_config.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            confab_config.logging.level = level;
        }

        confab_config.validate()?;

        Ok(confab_config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.hub.bind_address.is_empty() {
            return Err(ConfigLoadError::InvalidValue {
                key: "hub.bind_address".to_string(),
                message: "Must not be empty".to_string(),
            });
        }

        if self.hub.heartbeat_interval_secs == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "hub.heartbeat_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.hub.send_timeout_secs == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "hub.send_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.hub.outbound_queue_size == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "hub.outbound_queue_size".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (key, url) in [
            ("agent.hub_url", &self.agent.hub_url),
            ("client.hub_url", &self.client.hub_url),
        ] {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigLoadError::InvalidValue {
                    key: key.to_string(),
                    message: "Must be a WebSocket URL starting with ws:// or wss://".to_string(),
                });
            }
        }

        if self.agent.processing_interval_secs == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "agent.processing_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.agent.recent_window == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "agent.recent_window".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.agent.history_cap < self.agent.recent_window {
            return Err(ConfigLoadError::InvalidValue {
                key: "agent.history_cap".to_string(),
                message: "Cannot be smaller than agent.recent_window".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level_lower = self.logging.level.to_lowercase();
        if !valid_levels.contains(&level_lower.as_str()) && !level_lower.contains('=') {
            return Err(ConfigLoadError::InvalidValue {
                key: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Must be one of: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigLoadError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn get_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("config").join("default.toml"));
        paths.push(cwd.join("config").join("local.toml"));
        paths.push(cwd.join("confab.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("confab").join("config.toml"));
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".confab").join("config.toml"));
    }

    paths
}

fn load_dotenv_files() {
    for path in get_dotenv_paths() {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

fn get_dotenv_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
        paths.push(cwd.join(".env.local"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("confab").join(".env"));
    }

    paths
}

pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("confab"))
}
