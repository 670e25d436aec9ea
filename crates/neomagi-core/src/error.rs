use thiserror::Error;

#[derive(Debug, Error)]
pub enum NeoMagiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("User not found: {id}")]
    UserNotFound { id: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Channel error ({channel}): {reason}")]
    Channel { channel: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Session busy: {session_id}")]
    SessionBusy { session_id: String },

    #[error("Session lease fenced: {session_id}")]
    SessionFenced { session_id: String },

    #[error("Budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    #[error("Provider not available: {provider}")]
    ProviderNotAvailable { provider: String },

    #[error("Tool '{tool}' not permitted in mode '{mode}'")]
    ModeDenied { tool: String, mode: String },

    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("Invalid tool arguments for '{tool}': {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("Guardrail anchor missing: {reason}")]
    GuardAnchorMissing { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NeoMagiError {
    /// Short error code string sent to clients in WS RES frames.
    pub fn code(&self) -> &'static str {
        match self {
            NeoMagiError::Config(_) => "CONFIG_ERROR",
            NeoMagiError::AuthFailed(_) => "AUTH_FAILED",
            NeoMagiError::Protocol(_) => "PROTOCOL_ERROR",
            NeoMagiError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            NeoMagiError::PermissionDenied { .. } => "PERMISSION_DENIED",
            NeoMagiError::UserNotFound { .. } => "USER_NOT_FOUND",
            NeoMagiError::Database(_) => "DATABASE_ERROR",
            NeoMagiError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            NeoMagiError::Channel { .. } => "CHANNEL_ERROR",
            NeoMagiError::Serialization(_) => "SERIALIZATION_ERROR",
            NeoMagiError::Io(_) => "IO_ERROR",
            NeoMagiError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            NeoMagiError::Timeout { .. } => "TIMEOUT",
            NeoMagiError::SessionBusy { .. } => "SESSION_BUSY",
            NeoMagiError::SessionFenced { .. } => "SESSION_FENCED",
            NeoMagiError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            NeoMagiError::ProviderNotAvailable { .. } => "PROVIDER_NOT_AVAILABLE",
            NeoMagiError::ModeDenied { .. } => "MODE_DENIED",
            NeoMagiError::UnknownTool { .. } => "UNKNOWN_TOOL",
            NeoMagiError::InvalidArgs { .. } => "INVALID_ARGS",
            NeoMagiError::GuardAnchorMissing { .. } => "GUARD_ANCHOR_MISSING",
            NeoMagiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, NeoMagiError>;
