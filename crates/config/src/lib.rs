//! Configuration loading, validation, and management for toolweave.
//!
//! Loads configuration from `~/.toolweave/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.toolweave/config.toml`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider endpoint and model settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Orchestration loop limits and thresholds
    #[serde(default)]
    pub agent: AgentSettings,

    /// Plugin directory and hot reload
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Chunk store location and sizing
    #[serde(default)]
    pub chunks: ChunksConfig,

    /// Skill search paths
    #[serde(default)]
    pub skills: SkillsConfig,
}

/// OpenAI-compatible endpoint settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key (overridable via `TOOLWEAVE_API_KEY` / `OPENAI_API_KEY`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider display name
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL (without `/chat/completions`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request timeout, also applied to each streamed chunk read
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            name: default_provider_name(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider", &self.provider)
            .field("agent", &self.agent)
            .field("plugins", &self.plugins)
            .field("chunks", &self.chunks)
            .field("skills", &self.skills)
            .finish()
    }
}

/// Limits and thresholds of the orchestration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Request/tool cycles before a forced summary
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Retries after the first failed provider attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Tool results above this many estimated tokens are chunked
    #[serde(default = "default_chunk_threshold_tokens")]
    pub chunk_threshold_tokens: usize,

    /// History above this many estimated tokens is compressed
    #[serde(default = "default_history_budget_tokens")]
    pub history_budget_tokens: usize,

    /// Tool messages above this many estimated tokens are eligible for compression
    #[serde(default = "default_compress_threshold_tokens")]
    pub compress_threshold_tokens: usize,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Base system prompt; the built-in one is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_iterations() -> usize {
    20
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    2_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_chunk_threshold_tokens() -> usize {
    80_000
}
fn default_history_budget_tokens() -> usize {
    80_000
}
fn default_compress_threshold_tokens() -> usize {
    10_000
}
fn default_tool_timeout_secs() -> u64 {
    120
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            chunk_threshold_tokens: default_chunk_threshold_tokens(),
            history_budget_tokens: default_history_budget_tokens(),
            compress_threshold_tokens: default_compress_threshold_tokens(),
            tool_timeout_secs: default_tool_timeout_secs(),
            system_prompt: None,
        }
    }
}

/// Plugin discovery and hot reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for plugin files
    #[serde(default = "default_plugin_dir")]
    pub dir: PathBuf,

    /// Run the background poller
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tool-name prefix → service name (e.g. `dataproc` → `data_processor`)
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, String>,
}

fn default_plugin_dir() -> PathBuf {
    AppConfig::config_dir().join("plugins")
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_aliases() -> BTreeMap<String, String> {
    BTreeMap::from([("dataproc".to_string(), "data_processor".to_string())])
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            hot_reload: true,
            poll_interval_ms: default_poll_interval_ms(),
            aliases: default_aliases(),
        }
    }
}

impl PluginsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Chunk store location and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunksConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Character budget per chunk (25k tokens at 2.5 chars/token)
    #[serde(default = "default_max_chars_per_chunk")]
    pub max_chars_per_chunk: usize,
}

fn default_cache_dir() -> PathBuf {
    AppConfig::config_dir().join("cache")
}
fn default_max_chars_per_chunk() -> usize {
    62_500
}

impl Default for ChunksConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_chars_per_chunk: default_max_chars_per_chunk(),
        }
    }
}

/// Where skills are discovered. Later paths override earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "default_skill_paths")]
    pub paths: Vec<PathBuf>,
}

fn default_skill_paths() -> Vec<PathBuf> {
    vec![AppConfig::config_dir().join("skills")]
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            paths: default_skill_paths(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.toolweave/config.toml).
    ///
    /// Also checks environment variables:
    /// - `TOOLWEAVE_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `TOOLWEAVE_BASE_URL`
    /// - `TOOLWEAVE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = std::env::var("TOOLWEAVE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }
        if let Ok(url) = std::env::var("TOOLWEAVE_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("TOOLWEAVE_MODEL") {
            self.provider.model = model;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.initial_backoff_ms > self.agent.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "agent.initial_backoff_ms must not exceed agent.max_backoff_ms".into(),
            ));
        }
        if self.agent.compress_threshold_tokens == 0 || self.agent.chunk_threshold_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "token thresholds must be greater than 0".into(),
            ));
        }
        if self.chunks.max_chars_per_chunk == 0 {
            return Err(ConfigError::ValidationError(
                "chunks.max_chars_per_chunk must be greater than 0".into(),
            ));
        }
        if self.plugins.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "plugins.poll_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
