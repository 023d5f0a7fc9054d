//! Error types for the toolweave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all toolweave operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Plugin errors ---
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    // --- Chunk store errors ---
    #[error("Chunk store error: {0}")]
    Chunk(#[from] ChunkError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Run control ---
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a fresh attempt of the same request may succeed.
    ///
    /// Connection problems, timeouts, rate limits and 5xx responses are
    /// transient. Malformed requests, oversized contexts and auth failures
    /// will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::StreamInterrupted(_) => true,
            Self::RateLimited { .. } => true,
            Self::ApiError { status_code, .. } => *status_code >= 500 || *status_code == 408,
            Self::AuthenticationFailed(_)
            | Self::ModelNotFound(_)
            | Self::ContextLengthExceeded(_)
            | Self::NotConfigured(_) => false,
        }
    }
}

/// Failures raised while loading plugins or invoking their tools.
///
/// Every variant except `LoadFailed` is reported back to the model as a
/// structured tool error instead of aborting the conversation.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Tool not found: {tool} in plugin {service}")]
    ToolNotFound { service: String, tool: String },

    #[error("Missing required parameters for {tool}: {}", names.join(", "))]
    MissingArguments { tool: String, names: Vec<String> },

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool execution failed: {tool}: {reason}")]
    InvocationFailed { tool: String, reason: String },

    #[error("Tool timed out: {tool} after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("Failed to load plugin {plugin}: {reason}")]
    LoadFailed { plugin: String, reason: String },
}

impl PluginError {
    pub fn invocation(tool: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvocationFailed {
            tool: tool.into(),
            reason: reason.to_string(),
        }
    }

    pub fn load(plugin: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::LoadFailed {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Chunk not found: {0}")]
    NotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt record {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl From<std::io::Error> for ChunkError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
