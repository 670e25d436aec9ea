//! `neomagi-memory` — long-term user memory: facts, preferences, and
//! conversation history backing the agent's system prompt context.

pub mod daily_notes;
pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use daily_notes::{
    build_recent_notes_block, DailyNotesIndexer, DailyNotesWriter, MemoryEntryRow, MemoryWriteError, NoteEntry,
    ParsedNoteEntry,
};
pub use error::MemoryError;
pub use manager::MemoryManager;
pub use types::{MemoryCategory, MemorySource, UserContext, UserMemory};
