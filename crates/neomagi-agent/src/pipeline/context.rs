//! Shared context interface for all channel adapters.
//!
//! `MessageContext` is the single trait that every channel host (gateway, discord,
//! future telegram, etc.) must implement. It replaces the old `DiscordAppContext`
//! and lets the pipeline crate stay channel-agnostic.

use neomagi_memory::manager::MemoryManager;
use neomagi_scheduler::SchedulerHandle;
use neomagi_terminal::manager::TerminalManager;
use neomagi_users::resolver::UserResolver;

use crate::runtime::AgentRuntime;

/// Minimal context interface required by the shared message pipeline.
///
/// Implemented by `AppState` in `neomagi-gateway` and any future channel host.
/// Defined here (in `neomagi-agent`) to avoid circular dependency: all channel
/// crates depend on `neomagi-agent`; `neomagi-agent` depends only on `neomagi-core`,
/// `neomagi-memory`, `neomagi-scheduler`, `neomagi-terminal`, and `neomagi-users`.
pub trait MessageContext: Send + Sync {
    fn agent(&self) -> &AgentRuntime;
    fn memory(&self) -> &MemoryManager;
    fn terminal(&self) -> &tokio::sync::Mutex<TerminalManager>;
    fn scheduler(&self) -> &SchedulerHandle;
    fn users(&self) -> &UserResolver;

    /// Names of channels currently able to receive outbound messages via
    /// `send_to_channel` (e.g. `"discord"`, `"telegram"`).
    fn connected_channels(&self) -> Vec<String>;

    /// Deliver `message` to `recipient` on `channel`. Used by the
    /// `send_message` tool to cross-post between channels.
    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String>;

    /// Port the gateway's HTTP/WS listener is bound to, when this host runs one.
    fn gateway_port(&self) -> Option<u16> {
        None
    }

    /// Path to the host's primary SQLite database file, when it has one on disk.
    fn database_path(&self) -> Option<&str> {
        None
    }
}
