use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested session does not exist in the database.
    #[error("session not found: {key}")]
    NotFound { key: String },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided session key string is malformed.
    ///
    /// Expected format: `user:{user_id}:agent:{agent_id}:{name}`
    #[error("invalid session key: {0}")]
    InvalidKey(String),

    /// The user has reached the maximum allowed number of sessions.
    #[error("session limit exceeded for user {user_id}: max {limit}")]
    LimitExceeded { user_id: String, limit: usize },

    /// Another dispatch already holds the processing lease and its TTL has
    /// not yet expired.
    #[error("session busy: {session_id}")]
    Busy { session_id: String },

    /// The caller's fencing token no longer matches the lease holder — the
    /// lease was reclaimed (TTL expiry) by a later dispatch. The caller must
    /// abandon its in-flight work; it lost the race.
    #[error("session lease fenced: {session_id}")]
    Fenced { session_id: String },
}

impl SessionError {
    /// Short error code, mirrored onto the wire protocol's `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound { .. } => "SESSION_NOT_FOUND",
            SessionError::Database(_) => "DATABASE_ERROR",
            SessionError::InvalidKey(_) => "INVALID_SESSION_KEY",
            SessionError::LimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
            SessionError::Busy { .. } => "SESSION_BUSY",
            SessionError::Fenced { .. } => "SESSION_FENCED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
