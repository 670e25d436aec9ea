//! Tool re-export for the Telegram adapter.
//!
//! All tools are shared — implemented once in `neomagi-agent` and re-exported here
//! following the same thin-wrapper pattern as `neomagi-discord/src/tools.rs`.

pub use neomagi_agent::tools::build::build_tools;
