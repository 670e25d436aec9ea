use std::sync::Mutex;

use neomagi_core::types::ToolMode;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::types::{CompactionState, Message, Session, SessionKey};

/// Thread-safe manager for persisted sessions: identity, the append-only
/// message log, the single-writer processing lease, and compaction state.
///
/// Wraps a single SQLite connection in a `Mutex`. Every cross-step invariant
/// (fencing, monotonic seq allocation, monotonic compaction watermark) is
/// enforced by a single atomic `UPDATE ... RETURNING` statement rather than
/// by holding the mutex across an external call — no lock is ever held
/// while waiting on the LLM or another I/O-bound step.
pub struct SessionManager {
    db: Mutex<Connection>,
}

impl SessionManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Return an existing session or create a new one (upsert pattern).
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_or_create(&self, key: &SessionKey, default_mode: ToolMode) -> Result<Session> {
        let id = key.format();
        if let Some(session) = self.get_by_id(&id)? {
            debug!("session cache hit");
            return Ok(session);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions
             (id, user_id, agent_id, name, created_at, updated_at, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)",
            params![id, key.user_id, key.agent_id, key.name, now, default_mode.as_str()],
        )?;
        drop(db);

        self.get_by_id(&id)?
            .ok_or_else(|| SessionError::NotFound { key: id })
    }

    /// Retrieve a session by key, returning `None` if it does not exist.
    pub fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        self.get_by_id(&key.format())
    }

    /// Retrieve a session by its opaque storage id.
    #[instrument(skip(self), fields(session_id))]
    pub fn get_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, user_id, agent_id, name, title,
                    message_count, total_tokens, last_model, created_at, updated_at,
                    next_seq, lock_token, processing_since, mode,
                    compacted_context, compaction_metadata, last_compaction_seq,
                    memory_flush_candidates
             FROM sessions WHERE id = ?1",
            params![session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// List the most-recently-updated sessions for a user, newest first.
    #[instrument(skip(self), fields(user_id, limit))]
    pub fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, agent_id, name, title,
                    message_count, total_tokens, last_model, created_at, updated_at,
                    next_seq, lock_token, processing_since, mode,
                    compacted_context, compaction_metadata, last_compaction_seq,
                    memory_flush_candidates
             FROM sessions
             WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Permanently delete a session and its message log.
    #[instrument(skip(self), fields(key = %key))]
    pub fn delete(&self, key: &SessionKey) -> Result<()> {
        let id = key.format();
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if rows_changed == 0 {
            return Err(SessionError::NotFound { key: id });
        }
        Ok(())
    }

    /// Claim the single-writer processing lease for a session.
    ///
    /// Succeeds if the session is unclaimed, or if the existing claim's TTL
    /// has expired — a crashed dispatch self-heals instead of wedging the
    /// session forever. Returns the fresh fencing token on success.
    #[instrument(skip(self), fields(session_id, ttl_seconds))]
    pub fn try_claim_session(&self, session_id: &str, ttl_seconds: i64) -> Result<String> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let cutoff_ms = now_ms - ttl_seconds * 1000;
        let new_token = Uuid::new_v4().to_string();

        let db = self.db.lock().unwrap();
        let claimed: Option<String> = db
            .query_row(
                "UPDATE sessions
                 SET lock_token = ?1, processing_since = ?2
                 WHERE id = ?3
                   AND (lock_token IS NULL OR processing_since < ?4)
                 RETURNING lock_token",
                params![new_token, now_ms, session_id, cutoff_ms],
                |row| row.get(0),
            )
            .optional()?;

        match claimed {
            Some(token) => Ok(token),
            None => {
                let exists: bool = db
                    .query_row(
                        "SELECT 1 FROM sessions WHERE id = ?1",
                        params![session_id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                if exists {
                    Err(SessionError::Busy {
                        session_id: session_id.to_string(),
                    })
                } else {
                    Err(SessionError::NotFound {
                        key: session_id.to_string(),
                    })
                }
            }
        }
    }

    /// Release a previously claimed lease. Best-effort: if the fencing token
    /// no longer matches (the lease was reclaimed via TTL expiry by a later
    /// dispatch), this is a silent no-op rather than an error — the caller
    /// already lost the race and has nothing left to release.
    #[instrument(skip(self, lock_token), fields(session_id))]
    pub fn release_session(&self, session_id: &str, lock_token: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE sessions SET lock_token = NULL, processing_since = NULL
             WHERE id = ?1 AND lock_token = ?2",
            params![session_id, lock_token],
        )?;
        if rows == 0 {
            warn!("release_session no-op: lease already reclaimed");
        }
        Ok(())
    }

    /// Append a message to the session log under the caller's fencing token.
    ///
    /// Allocates the next `seq` and inserts the row in one transaction, so
    /// concurrent appends (impossible under a correctly held lease, but not
    /// ruled out by SQLite itself) can never collide on `seq`.
    #[instrument(skip(self, lock_token, content), fields(session_id, role))]
    pub fn append_message(
        &self,
        session_id: &str,
        lock_token: &str,
        role: &str,
        content: &str,
        tokens: Option<i64>,
        model: Option<&str>,
    ) -> Result<Message> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let seq: Option<i64> = tx
            .query_row(
                "UPDATE sessions
                 SET next_seq = next_seq + 1,
                     message_count = message_count + 1,
                     total_tokens = total_tokens + ?1,
                     last_model = COALESCE(?2, last_model),
                     updated_at = ?3
                 WHERE id = ?4 AND lock_token = ?5
                 RETURNING next_seq - 1",
                params![tokens.unwrap_or(0), model, now, session_id, lock_token],
                |row| row.get(0),
            )
            .optional()?;

        let seq = match seq {
            Some(s) => s,
            None => {
                return Err(SessionError::Fenced {
                    session_id: session_id.to_string(),
                });
            }
        };

        tx.execute(
            "INSERT INTO messages (session_id, seq, role, content, tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, seq, role, content, tokens, now],
        )?;
        tx.commit()?;

        Ok(Message {
            session_id: session_id.to_string(),
            seq,
            role: role.to_string(),
            content: content.to_string(),
            tokens,
            created_at: now,
        })
    }

    /// Compacted summary plus every message since the last compaction —
    /// exactly what the prompt builder and compaction engine need to
    /// reconstruct "effective" history without replaying the full log.
    #[instrument(skip(self), fields(session_id))]
    pub fn get_effective_history(&self, session_id: &str) -> Result<(Option<String>, Vec<Message>)> {
        let db = self.db.lock().unwrap();
        let (compacted_context, last_compaction_seq): (Option<String>, i64) = db
            .query_row(
                "SELECT compacted_context, last_compaction_seq FROM sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SessionError::NotFound {
                    key: session_id.to_string(),
                },
                e => SessionError::Database(e),
            })?;

        let mut stmt = db.prepare(
            "SELECT session_id, seq, role, content, tokens, created_at
             FROM messages WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session_id, last_compaction_seq], row_to_message)?;
        Ok((compacted_context, rows.filter_map(|r| r.ok()).collect()))
    }

    /// Snapshot of the fields the compaction engine needs before it decides
    /// whether to run.
    #[instrument(skip(self), fields(session_id))]
    pub fn get_compaction_state(&self, session_id: &str) -> Result<CompactionState> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT last_compaction_seq, compacted_context, compaction_metadata, next_seq
             FROM sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok(CompactionState {
                    last_compaction_seq: row.get(0)?,
                    compacted_context: row.get(1)?,
                    compaction_metadata: row.get(2)?,
                    next_seq: row.get(3)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SessionError::NotFound {
                key: session_id.to_string(),
            },
            e => SessionError::Database(e),
        })
    }

    /// Store the result of a compaction run. Guarded by both the fencing
    /// token and a monotonicity check on `last_compaction_seq` — a stale or
    /// reordered write (e.g. a slow compaction finishing after a newer one)
    /// is silently dropped rather than clobbering a newer summary.
    #[instrument(skip(self, lock_token, compacted_context, metadata_json), fields(session_id, new_last_compaction_seq))]
    pub fn store_compaction_result(
        &self,
        session_id: &str,
        lock_token: &str,
        compacted_context: &str,
        new_last_compaction_seq: i64,
        metadata_json: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let updated: Option<i64> = db
            .query_row(
                "UPDATE sessions
                 SET compacted_context = ?1,
                     compaction_metadata = ?2,
                     last_compaction_seq = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND lock_token = ?6 AND last_compaction_seq < ?3
                 RETURNING last_compaction_seq",
                params![
                    compacted_context,
                    metadata_json,
                    new_last_compaction_seq,
                    now,
                    session_id,
                    lock_token
                ],
                |row| row.get(0),
            )
            .optional()?;

        match updated {
            Some(_) => Ok(()),
            None => Err(SessionError::Fenced {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Fail-closed mode lookup: an unknown session or an unparseable stored
    /// value both downgrade to `ToolMode::ChatSafe`, never to the more
    /// permissive mode.
    #[instrument(skip(self), fields(session_id))]
    pub fn get_mode(&self, session_id: &str) -> ToolMode {
        let db = self.db.lock().unwrap();
        let mode_str: Option<String> = db
            .query_row(
                "SELECT mode FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);

        match mode_str {
            Some(s) => s.parse().unwrap_or_default(),
            None => ToolMode::default(),
        }
    }

    /// Update a session's tool mode.
    #[instrument(skip(self), fields(session_id, mode = %mode))]
    pub fn set_mode(&self, session_id: &str, mode: ToolMode) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE sessions SET mode = ?1, updated_at = ?2 WHERE id = ?3",
            params![mode.as_str(), now, session_id],
        )?;
        if rows == 0 {
            return Err(SessionError::NotFound {
                key: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Replace the set of pending memory-flush candidates for a session.
    /// Guarded by the fencing token since flush candidates are produced as
    /// part of per-turn processing, under an active lease.
    #[instrument(skip(self, lock_token, candidates_json), fields(session_id))]
    pub fn set_flush_candidates(
        &self,
        session_id: &str,
        lock_token: &str,
        candidates_json: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE sessions SET memory_flush_candidates = ?1 WHERE id = ?2 AND lock_token = ?3",
            params![candidates_json, session_id, lock_token],
        )?;
        if rows == 0 {
            return Err(SessionError::Fenced {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let agent_id: String = row.get(2)?;
    let name: String = row.get(3)?;
    let mode_str: String = row.get(13)?;

    Ok(Session {
        key: SessionKey::parse(&id).unwrap_or_else(|_| SessionKey {
            user_id,
            agent_id,
            name,
        }),
        id,
        title: row.get(4)?,
        message_count: row.get::<_, i64>(5)? as u32,
        total_tokens: row.get::<_, i64>(6)? as u64,
        last_model: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        next_seq: row.get(10)?,
        lock_token: row.get(11)?,
        processing_since: row.get(12)?,
        mode: mode_str.parse().unwrap_or_default(),
        compacted_context: row.get(14)?,
        compaction_metadata: row.get(15)?,
        last_compaction_seq: row.get(16)?,
        memory_flush_candidates: row.get(17)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        session_id: row.get(0)?,
        seq: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tokens: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mem() -> SessionManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        SessionManager::new(conn)
    }

    #[test]
    fn create_then_get_round_trips() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let created = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();
        assert_eq!(created.next_seq, 1);
        assert_eq!(created.mode, ToolMode::ChatSafe);

        let fetched = mgr.get(&key).unwrap().expect("session should exist");
        assert_eq!(fetched.id, created.id);
    }

    #[test]
    fn claim_then_second_claim_is_busy() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let s = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();

        let token = mgr.try_claim_session(&s.id, 120).unwrap();
        assert!(!token.is_empty());

        let err = mgr.try_claim_session(&s.id, 120).unwrap_err();
        assert!(matches!(err, SessionError::Busy { .. }));
    }

    #[test]
    fn expired_claim_can_be_reclaimed() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let s = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();

        mgr.try_claim_session(&s.id, -1).unwrap(); // already "expired" TTL

        let second = mgr.try_claim_session(&s.id, 120);
        assert!(second.is_ok());
    }

    #[test]
    fn release_with_stale_token_is_noop_not_error() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let s = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();
        let token = mgr.try_claim_session(&s.id, 120).unwrap();

        mgr.release_session(&s.id, &token).unwrap();
        // Releasing again with the now-stale token must not error.
        assert!(mgr.release_session(&s.id, &token).is_ok());
    }

    #[test]
    fn append_message_without_lease_is_fenced() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let s = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();

        let err = mgr
            .append_message(&s.id, "not-a-real-token", "user", "hi", None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Fenced { .. }));
    }

    #[test]
    fn append_message_allocates_monotonic_seq() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let s = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();
        let token = mgr.try_claim_session(&s.id, 120).unwrap();

        let m1 = mgr
            .append_message(&s.id, &token, "user", "hello", Some(3), Some("claude"))
            .unwrap();
        let m2 = mgr
            .append_message(&s.id, &token, "assistant", "hi there", Some(5), Some("claude"))
            .unwrap();

        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);

        let updated = mgr.get_by_id(&s.id).unwrap().unwrap();
        assert_eq!(updated.message_count, 2);
        assert_eq!(updated.total_tokens, 8);
        assert_eq!(updated.last_model.as_deref(), Some("claude"));
    }

    #[test]
    fn store_compaction_result_rejects_stale_seq() {
        let mgr = open_mem();
        let key = SessionKey::new("u1", "main", "main");
        let s = mgr.get_or_create(&key, ToolMode::ChatSafe).unwrap();
        let token = mgr.try_claim_session(&s.id, 120).unwrap();

        mgr.store_compaction_result(&s.id, &token, "summary v1", 5, "{}")
            .unwrap();

        // A second attempt with a seq that doesn't move the watermark forward
        // must be rejected, not silently accepted.
        let err = mgr
            .store_compaction_result(&s.id, &token, "summary v0", 5, "{}")
            .unwrap_err();
        assert!(matches!(err, SessionError::Fenced { .. }));
    }

    #[test]
    fn get_mode_fails_closed_for_unknown_session() {
        let mgr = open_mem();
        assert_eq!(mgr.get_mode("does-not-exist"), ToolMode::ChatSafe);
    }
}
