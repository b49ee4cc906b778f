use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArgs { tool: String, message: String },

    #[error("Node id '{0}' is reserved and cannot be synchronized")]
    ReservedId(String),

    #[error("Request for {tool} timed out after {after_ms}ms")]
    Timeout { tool: String, after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Structured `{ "error": message }` body returned to automation callers.
    pub fn to_payload(&self) -> serde_json::Value {
        json!({ "error": self.to_string() })
    }

    /// Short machine-readable kind, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Protocol(_) => "protocol",
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArgs { .. } => "invalid_args",
            Self::ReservedId(_) => "reserved_id",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
