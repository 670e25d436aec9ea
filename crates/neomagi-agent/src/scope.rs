//! Pure scope resolution: channel identity → a stable session storage key.
//!
//! No I/O, no struct holding handles — every function here is a total or
//! fallible pure transform, callable from any channel adapter or the
//! dispatch orchestrator without constructing anything first.

use thiserror::Error;

/// Minimal identity needed to resolve a scope. `peer_id` is required by the
/// `per-channel-peer` and `per-peer` scopes; `channel_id` set means the
/// message came from a group/shared channel rather than a direct message.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub channel_type: String,
    pub channel_id: Option<String>,
    pub peer_id: Option<String>,
    pub account_id: Option<String>,
}

impl SessionIdentity {
    pub fn new(session_id: impl Into<String>, channel_type: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            channel_type: channel_type.into(),
            channel_id: None,
            peer_id: None,
            account_id: None,
        }
    }

    pub fn with_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("peer_id required for dm_scope '{scope}'")]
    MissingPeerId { scope: String },

    #[error("unsupported dm_scope: '{0}'")]
    UnsupportedScope(String),
}

/// identity + dm_scope → scope_key.
///
/// - `"main"` → `"main"` (single global shared session).
/// - `"per-channel-peer"` → `"{channel_type}:peer:{peer_id}"` (the Telegram
///   default: each peer gets their own session per channel).
/// - `"per-peer"` → `"peer:{peer_id}"` (the same peer shares one session
///   across every channel they use).
pub fn resolve_scope_key(identity: &SessionIdentity, dm_scope: &str) -> Result<String, ScopeError> {
    match dm_scope {
        "main" => Ok("main".to_string()),
        "per-channel-peer" => {
            let peer_id = identity.peer_id.as_ref().ok_or_else(|| ScopeError::MissingPeerId {
                scope: dm_scope.to_string(),
            })?;
            Ok(format!("{}:peer:{}", identity.channel_type, peer_id))
        }
        "per-peer" => {
            let peer_id = identity.peer_id.as_ref().ok_or_else(|| ScopeError::MissingPeerId {
                scope: dm_scope.to_string(),
            })?;
            Ok(format!("peer:{peer_id}"))
        }
        other => Err(ScopeError::UnsupportedScope(other.to_string())),
    }
}

/// identity + dm_scope → session storage key.
///
/// A direct message (no `channel_id`) resolves through `resolve_scope_key`.
/// A group/shared channel message always gets its own session, regardless
/// of `dm_scope` — group conversations are never split per-peer.
pub fn resolve_session_key(identity: &SessionIdentity, dm_scope: &str) -> Result<String, ScopeError> {
    match &identity.channel_id {
        Some(channel_id) => Ok(format!("group:{channel_id}")),
        None => resolve_scope_key(identity, dm_scope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("s1", "telegram").with_peer("42")
    }

    #[test]
    fn main_scope_is_global() {
        assert_eq!(resolve_scope_key(&identity(), "main").unwrap(), "main");
    }

    #[test]
    fn per_channel_peer_includes_channel_type() {
        assert_eq!(
            resolve_scope_key(&identity(), "per-channel-peer").unwrap(),
            "telegram:peer:42"
        );
    }

    #[test]
    fn per_peer_is_channel_agnostic() {
        assert_eq!(resolve_scope_key(&identity(), "per-peer").unwrap(), "peer:42");
    }

    #[test]
    fn per_channel_peer_without_peer_id_errors() {
        let identity = SessionIdentity::new("s1", "telegram");
        let err = resolve_scope_key(&identity, "per-channel-peer").unwrap_err();
        assert!(matches!(err, ScopeError::MissingPeerId { .. }));
    }

    #[test]
    fn unsupported_scope_errors() {
        let err = resolve_scope_key(&identity(), "per-galaxy").unwrap_err();
        assert!(matches!(err, ScopeError::UnsupportedScope(_)));
    }

    #[test]
    fn group_channel_overrides_dm_scope() {
        let identity = identity().with_channel_id("g-7");
        assert_eq!(resolve_session_key(&identity, "per-peer").unwrap(), "group:g-7");
    }

    #[test]
    fn dm_without_channel_id_uses_dm_scope() {
        assert_eq!(resolve_session_key(&identity(), "main").unwrap(), "main");
    }
}
