use rusqlite::Connection;

use crate::error::Result;

/// Initialise the single-row spend ledger and the reservations log.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS budget_state (
            id                 INTEGER PRIMARY KEY CHECK (id = 1),
            cumulative_micros  INTEGER NOT NULL DEFAULT 0
        );
        INSERT OR IGNORE INTO budget_state (id, cumulative_micros) VALUES (1, 0);

        CREATE TABLE IF NOT EXISTS budget_reservations (
            id                TEXT PRIMARY KEY,
            session_id        TEXT NOT NULL,
            reserved_micros   INTEGER NOT NULL,
            status            TEXT NOT NULL DEFAULT 'reserved',
            created_at        TEXT NOT NULL,
            settled_at        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_budget_reservations_session
            ON budget_reservations(session_id);",
    )?;
    Ok(())
}
