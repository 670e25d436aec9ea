use rusqlite::Connection;

use crate::error::Result;

/// Initialise the sessions and messages tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                       TEXT PRIMARY KEY,
            user_id                  TEXT NOT NULL,
            agent_id                 TEXT NOT NULL,
            name                     TEXT NOT NULL,
            title                    TEXT,
            message_count            INTEGER NOT NULL DEFAULT 0,
            total_tokens             INTEGER NOT NULL DEFAULT 0,
            last_model               TEXT,
            created_at               TEXT NOT NULL,
            updated_at               TEXT NOT NULL,
            next_seq                 INTEGER NOT NULL DEFAULT 1,
            lock_token               TEXT,
            processing_since         INTEGER,
            mode                     TEXT NOT NULL DEFAULT 'chat_safe',
            compacted_context        TEXT,
            compaction_metadata      TEXT,
            last_compaction_seq      INTEGER NOT NULL DEFAULT 0,
            memory_flush_candidates  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            seq         INTEGER NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            tokens      INTEGER,
            created_at  TEXT NOT NULL,
            UNIQUE(session_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session_seq
            ON messages(session_id, seq);",
    )?;
    Ok(())
}
