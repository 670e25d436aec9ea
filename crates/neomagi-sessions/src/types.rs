use neomagi_core::types::ToolMode;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Structured, user-centric session key.
///
/// NeoMagi sessions belong to users, not channels — unlike OpenClaw which was
/// channel-centric. This means Alice on Telegram and Alice on Discord share
/// the same session: `user:{user_id}:agent:{agent_id}:{name}`.
///
/// The formatted string doubles as the session's opaque storage identifier —
/// the session store never interprets it beyond treating it as a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub agent_id: String,
    pub name: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            name: name.into(),
        }
    }

    /// Return the canonical wire-format string.
    ///
    /// Format: `user:{user_id}:agent:{agent_id}:{name}`
    pub fn format(&self) -> String {
        format!("user:{}:agent:{}:{}", self.user_id, self.agent_id, self.name)
    }

    /// Parse a wire-format key string back into a `SessionKey`.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("user:")
            .ok_or_else(|| SessionError::InvalidKey(format!("missing 'user:' prefix: {s}")))?;

        let agent_marker = ":agent:";
        let agent_pos = rest
            .find(agent_marker)
            .ok_or_else(|| SessionError::InvalidKey(format!("missing ':agent:' segment: {s}")))?;

        let user_id = &rest[..agent_pos];
        let after_agent = &rest[agent_pos + agent_marker.len()..];

        let colon_pos = after_agent
            .find(':')
            .ok_or_else(|| SessionError::InvalidKey(format!("missing session name segment: {s}")))?;

        let agent_id = &after_agent[..colon_pos];
        let name = &after_agent[colon_pos + 1..];

        if user_id.is_empty() || agent_id.is_empty() || name.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }

        Ok(Self {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// A persisted conversation session.
///
/// The primary key `id` is the formatted `SessionKey` string — sessions are
/// identified by an opaque string everywhere above the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub key: SessionKey,
    pub title: Option<String>,
    pub message_count: u32,
    pub total_tokens: u64,
    pub last_model: Option<String>,
    pub created_at: String,
    pub updated_at: String,

    /// Next sequence number to assign to an appended message.
    pub next_seq: i64,
    /// Fencing token held by whoever currently owns the processing lease.
    /// `None` when the session is not claimed.
    pub lock_token: Option<String>,
    /// Epoch millis when the current lease was claimed, for TTL expiry.
    pub processing_since: Option<i64>,
    /// Capability profile gating which tools this session may invoke.
    pub mode: ToolMode,
    /// Rolling compacted summary produced by the compaction engine, if any.
    pub compacted_context: Option<String>,
    /// Opaque JSON metadata describing the most recent compaction run.
    pub compaction_metadata: Option<String>,
    /// Highest message `seq` folded into `compacted_context` so far.
    pub last_compaction_seq: i64,
    /// JSON array of memory-flush candidates awaiting a decision.
    pub memory_flush_candidates: Option<String>,
}

/// A single turn in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub tokens: Option<i64>,
    pub created_at: String,
}

/// Snapshot of a session's compaction-relevant state, read before running
/// the compaction engine.
#[derive(Debug, Clone)]
pub struct CompactionState {
    pub last_compaction_seq: i64,
    pub compacted_context: Option<String>,
    pub compaction_metadata: Option<String>,
    pub next_seq: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_key() {
        let key = SessionKey::new("u-123", "main", "main");
        let s = key.format();
        assert_eq!(s, "user:u-123:agent:main:main");
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed, key);
    }

    #[test]
    fn roundtrip_name_with_colons() {
        let key = SessionKey::new("u-999", "main", "trip:paris:2026");
        let s = key.format();
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed.name, "trip:paris:2026");
    }

    #[test]
    fn parse_missing_agent_returns_err() {
        assert!(SessionKey::parse("user:u-1:main:main").is_err());
    }

    #[test]
    fn parse_missing_user_prefix_returns_err() {
        assert!(SessionKey::parse("agent:main:main").is_err());
    }
}
