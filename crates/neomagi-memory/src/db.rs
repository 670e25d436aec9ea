use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_user_memory_table(conn)?;
    create_fts_index(conn)?;
    create_conversations_table(conn)?;
    create_memory_entries_table(conn)?;
    Ok(())
}

fn create_user_memory_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_memory (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            category    TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            confidence  REAL NOT NULL DEFAULT 0.8,
            source      TEXT NOT NULL DEFAULT 'inferred',
            expires_at  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_id, category, key)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_user
            ON user_memory(user_id);",
    )
}

/// FTS5 virtual table for full-text search across memory keys and values.
/// content='' makes it an external-content table â€” we sync manually on write.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS user_memory_fts
            USING fts5(key, value, content='user_memory', content_rowid='id');",
    )
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT,
            session_key TEXT NOT NULL,
            channel     TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            model_used  TEXT,
            tokens_in   INTEGER NOT NULL DEFAULT 0,
            tokens_out  INTEGER NOT NULL DEFAULT 0,
            cost_usd    REAL NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conv_user
            ON conversations(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_conv_session
            ON conversations(session_key, created_at);",
    )
}

/// Indexed mirror of file-backed daily notes plus any curated (non-file)
/// memory entries — backs scope-filtered recall search (C9).
///
/// `source_path` is the indexing key for idempotent delete-then-reinsert:
/// re-indexing a daily note file drops every row previously indexed from
/// that path before inserting the fresh set, so repeated appends never
/// accumulate duplicate rows. Curated entries (no file behind them) carry
/// `source_path = NULL` and are never deduplicated this way.
fn create_memory_entries_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_entries (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            scope_key     TEXT NOT NULL,
            source_type   TEXT NOT NULL,
            source_path   TEXT,
            source_date   TEXT,
            title         TEXT,
            content       TEXT NOT NULL,
            tags          TEXT,
            confidence    REAL NOT NULL DEFAULT 0.5,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_entries_scope
            ON memory_entries(scope_key);
        CREATE INDEX IF NOT EXISTS idx_memory_entries_source_path
            ON memory_entries(source_path);
        CREATE VIRTUAL TABLE IF NOT EXISTS memory_entries_fts
            USING fts5(title, content, content='memory_entries', content_rowid='id');",
    )
}
