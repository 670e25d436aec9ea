//! Discord context interface — re-exported from the shared pipeline.
//!
//! `DiscordAppContext` is now an alias for `neomagi_agent::pipeline::MessageContext`.
//! All channel adapters share the same trait, defined once in `neomagi-agent` to
//! avoid circular dependencies.

pub use neomagi_agent::pipeline::MessageContext as DiscordAppContext;
