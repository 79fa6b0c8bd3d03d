use thiserror::Error;

#[derive(Debug, Error)]
pub enum CortexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Digest store error: {0}")]
    Store(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("State file error: {0}")]
    State(String),

    #[error("CSV loader error: {0}")]
    Loader(String),

    #[error("MCP hub error: {0}")]
    Hub(String),

    #[error("Tool call failed ({tool}): {reason}")]
    ToolCall { tool: String, reason: String },

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Pipeline blocked: {reason}")]
    Blocked { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CortexError {
    /// Short error code string surfaced through the runtime API.
    pub fn code(&self) -> &'static str {
        match self {
            CortexError::Config(_) => "CONFIG_ERROR",
            CortexError::Store(_) => "STORE_ERROR",
            CortexError::Lock(_) => "LOCK_ERROR",
            CortexError::State(_) => "STATE_ERROR",
            CortexError::Loader(_) => "LOADER_ERROR",
            CortexError::Hub(_) => "HUB_ERROR",
            CortexError::ToolCall { .. } => "TOOL_CALL_ERROR",
            CortexError::Provider(_) => "PROVIDER_ERROR",
            CortexError::Blocked { .. } => "BLOCKED",
            CortexError::Serialization(_) => "SERIALIZATION_ERROR",
            CortexError::Io(_) => "IO_ERROR",
            CortexError::Timeout { .. } => "TIMEOUT",
            CortexError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CortexError>;
