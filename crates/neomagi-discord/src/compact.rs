//! Session compaction for Discord.
//!
//! The canonical implementation lives in `neomagi_agent::pipeline::compact`
//! (`CompactionEngine`), orchestrated by the dispatch layer rather than
//! spawned per-channel.
