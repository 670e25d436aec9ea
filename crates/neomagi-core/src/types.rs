use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a user (UUIDv7 — time-sortable for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        // UUIDv7 includes timestamp — sortable and traceable in logs
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies which agent instance handles a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// The default single-agent setup uses "main".
    pub fn main() -> Self {
        Self("main".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User-centric session key.
///
/// Breaking change from OpenClaw: sessions belong to users, not channels.
/// Format: `user:{user_id}:agent:{agent_id}:{session_name}`
///
/// Alice on Telegram + Alice on Discord = same session `user:u2:agent:main:main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn for_user(user_id: &UserId, agent_id: &AgentId, session: &str) -> Self {
        Self(format!("user:{}:agent:{}:{}", user_id, agent_id, session))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection identifier (random UUID, not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User role hierarchy: admin > user > child.
///
/// Controls which permissions are available without a DB lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
    Child,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }

    pub fn is_child(&self) -> bool {
        matches!(self, UserRole::Child)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::User => write!(f, "user"),
            UserRole::Child => write!(f, "child"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            "child" => Ok(UserRole::Child),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Coarse capability profile restricting which tools a session may invoke.
///
/// Sessions are fail-closed: `get_mode` always downgrades unknown or invalid
/// values to `ChatSafe`, and this milestone only honors `ChatSafe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    #[default]
    ChatSafe,
    Coding,
}

impl ToolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolMode::ChatSafe => "chat_safe",
            ToolMode::Coding => "coding",
        }
    }
}

impl std::fmt::Display for ToolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chat_safe" => Ok(ToolMode::ChatSafe),
            "coding" => Ok(ToolMode::Coding),
            other => Err(format!("unknown tool mode: {}", other)),
        }
    }
}

/// Per-tool risk tag consumed by the guardrail (`check_pre_tool_guard`).
///
/// Undeclared tools default to `High` (fail-closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    High,
}

/// Domain classification for a tool. Orthogonal to `RiskLevel` — the
/// guardrail gates on risk, never on group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    #[default]
    Code,
    Memory,
    World,
}

/// A message destined for another channel, carried over a
/// `mpsc::Sender<ChannelOutbound>` queued per connected channel. Used by the
/// `send_message` tool and the gateway's `MessageContext::send_to_channel`
/// to cross-post between channels (e.g. Discord -> Telegram).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutbound {
    /// Channel-specific recipient identifier (e.g. a Telegram chat ID, a
    /// Discord user ID), carried as a string and parsed by the receiving
    /// adapter.
    pub recipient: String,
    pub message: String,
}
