//! Telegram context interface — re-exported from the shared pipeline.
//!
//! `TelegramAppContext` is an alias for `neomagi_agent::pipeline::MessageContext`.
//! All channel adapters share the same trait, defined once in `neomagi-agent`.

pub use neomagi_agent::pipeline::MessageContext as TelegramAppContext;
