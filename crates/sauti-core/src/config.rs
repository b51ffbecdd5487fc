//! Gateway configuration.
//!
//! Loaded from a YAML file discovered by convention (`config.yaml` in the
//! working directory, or the path in `SAUTI_CONFIG`), then overlaid with
//! environment variables for the handful of deploy-time scalars.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_ENV: &str = "SAUTI_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub tasks: TaskManagerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub ota: OtaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds allowed for live sessions to drain on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// When true, connections with invalid tokens are rejected instead of
    /// admitted-with-warning.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strict: false,
            secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// Vendor selection and connection settings for one provider kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry key, e.g. `"openai"`.
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Default voice for TTS providers.
    #[serde(default)]
    pub voice: Option<String>,
    /// Vendor-specific extras passed through untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            voice: None,
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub asr: ProviderConfig,
    #[serde(default)]
    pub llm: ProviderConfig,
    /// Optional; when absent, image queries degrade to the LLM with a
    /// textual placeholder.
    #[serde(default)]
    pub vlllm: Option<ProviderConfig>,
    #[serde(default)]
    pub tts: ProviderConfig,
}

/// Sizing for one provider pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min")]
    pub min: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
    #[serde(default = "default_pool_refill")]
    pub refill_size: usize,
    #[serde(default = "default_pool_check_secs")]
    pub check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            refill_size: default_pool_refill(),
            check_interval_secs: default_pool_check_secs(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(Error::Config(format!(
                "invalid pool config: min={} max={}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default)]
    pub asr: PoolConfig,
    #[serde(default)]
    pub llm: PoolConfig,
    #[serde(default)]
    pub vlllm: PoolConfig,
    #[serde(default)]
    pub tts: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_sentence_chars")]
    pub max_sentence_chars: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_turns: default_max_turns(),
            max_sentence_chars: default_max_sentence_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_tasks_per_client")]
    pub max_tasks_per_client: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_tasks_per_client: default_max_tasks_per_client(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs also go to daily-rotated files in this directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub firmware_url: String,
    /// WebSocket endpoint advertised to devices.
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            firmware_version: String::new(),
            firmware_url: String::new(),
            websocket_url: default_websocket_url(),
        }
    }
}

impl Config {
    /// Load from `path`, the `SAUTI_CONFIG` env var, or `config.yaml`,
    /// in that order. A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let (resolved, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var(CONFIG_ENV) {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        let mut config = if resolved.exists() {
            let raw = std::fs::read_to_string(&resolved)
                .map_err(|e| Error::Config(format!("read {}: {e}", resolved.display())))?;
            serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("parse {}: {e}", resolved.display())))?
        } else if required {
            return Err(Error::Config(format!(
                "config file not found: {}",
                resolved.display()
            )));
        } else {
            Config::default()
        };

        config.apply_env_overlay();
        config.validate()?;
        Ok((config, resolved))
    }

    /// Environment variables override the file for deploy-time scalars.
    pub fn apply_env_overlay(&mut self) {
        if let Ok(host) = std::env::var("SAUTI_HOST") {
            let host = host.trim();
            if !host.is_empty() {
                self.server.host = host.to_string();
            }
        }
        if let Ok(port) = std::env::var("SAUTI_PORT") {
            match port.trim().parse::<u16>() {
                Ok(parsed) => self.server.port = parsed,
                Err(_) => tracing::warn!("invalid SAUTI_PORT='{port}', keeping {}", self.server.port),
            }
        }
        if let Ok(secret) = std::env::var("SAUTI_AUTH_SECRET") {
            if !secret.is_empty() {
                self.auth.secret = secret;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.pools.asr.validate()?;
        self.pools.llm.validate()?;
        self.pools.vlllm.validate()?;
        self.pools.tts.validate()?;
        if self.auth.enabled && self.auth.secret.is_empty() {
            return Err(Error::Config(
                "auth.enabled requires auth.secret".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

fn default_token_ttl_secs() -> u64 {
    30 * 24 * 3600
}

fn default_provider_kind() -> String {
    "openai".to_string()
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_max() -> usize {
    8
}

fn default_pool_refill() -> usize {
    2
}

fn default_pool_check_secs() -> u64 {
    30
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Reply with concise spoken-friendly language. \
     Avoid markdown. Keep responses brief unless asked for details."
        .to_string()
}

fn default_max_turns() -> usize {
    24
}

fn default_max_sentence_chars() -> usize {
    120
}

fn default_max_workers() -> usize {
    12
}

fn default_max_tasks_per_client() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_websocket_url() -> String {
    "ws://0.0.0.0:8000/ws".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.tasks.max_workers, 12);
        assert_eq!(config.tasks.max_tasks_per_client, 20);
    }

    #[test]
    fn pool_config_rejects_min_above_max() {
        let pool = PoolConfig {
            min: 4,
            max: 2,
            ..PoolConfig::default()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn auth_enabled_requires_secret() {
        let mut config = Config::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());
        config.auth.secret = "s3cret".to_string();
        config.validate().expect("secret satisfies auth");
    }

    #[test]
    fn yaml_round_trip_preserves_provider_extras() {
        let raw = r#"
providers:
  llm:
    kind: openai
    base_url: http://localhost:11434/v1
    model: qwen3
    temperature: 0.7
pools:
  llm:
    min: 2
    max: 4
"#;
        let config: Config = serde_yaml::from_str(raw).expect("yaml should parse");
        assert_eq!(config.providers.llm.model, "qwen3");
        assert_eq!(config.pools.llm.min, 2);
        assert!(config.providers.llm.extra.contains_key("temperature"));
    }
}
