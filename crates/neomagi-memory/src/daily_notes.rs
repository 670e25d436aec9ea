//! File-backed daily notes: an append-only `memory/YYYY-MM-DD.md` journal
//! per workspace, plus a SQLite FTS index over its entries for scoped
//! recall search.
//!
//! This is deliberately a second, independent memory mechanism from
//! [`crate::manager::MemoryManager`]'s `user_memory` table — daily notes are
//! human-readable files meant to be read and edited directly, the index
//! exists only to make them searchable by scope without re-reading every
//! file on every turn.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;

use crate::error::MemoryError;

#[derive(Debug, Error)]
pub enum MemoryWriteError {
    #[error("writing entry would grow {date}.md to {bytes} bytes, over the {budget}-byte daily budget")]
    BudgetExceeded {
        date: String,
        bytes: usize,
        budget: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A note to append. `source_type` and `scope_key` are recorded on the
/// entry's metadata line so the indexer and the scope-filtered prompt
/// reader can both recover them without re-parsing free text.
pub struct NoteEntry<'a> {
    pub source_type: &'a str,
    pub scope_key: &'a str,
    pub title: Option<&'a str>,
    pub content: &'a str,
}

/// One entry parsed back out of a daily note file.
#[derive(Debug, Clone)]
pub struct ParsedNoteEntry {
    pub time: String,
    pub source_type: String,
    pub scope_key: String,
    pub title: Option<String>,
    pub body: String,
}

/// Metadata line format: `[HH:MM] (source: X, scope: Y)`.
fn format_metadata_line(time: &str, source_type: &str, scope_key: &str) -> String {
    format!("[{time}] (source: {source_type}, scope: {scope_key})")
}

/// Parse a metadata line back into its three fields. Returns `None` if the
/// line doesn't match the expected shape — callers default such entries to
/// scope `"main"` rather than dropping them.
fn parse_metadata_line(line: &str) -> Option<(String, String, String)> {
    let line = line.trim();
    let rest = line.strip_prefix('[')?;
    let (time, rest) = rest.split_once(']')?;
    let rest = rest.trim().strip_prefix('(')?.strip_suffix(')')?;

    let mut source_type = None;
    let mut scope_key = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("source:") {
            source_type = Some(v.trim().to_string());
        } else if let Some(v) = part.strip_prefix("scope:") {
            scope_key = Some(v.trim().to_string());
        }
    }

    Some((time.trim().to_string(), source_type?, scope_key.unwrap_or_else(|| "main".to_string())))
}

/// Split a daily note file's content into entries separated by `---` lines.
/// Entries without a recognizable metadata line are skipped — they predate
/// this format or were hand-edited without one, and can't be scope-filtered.
pub fn parse_daily_note(content: &str) -> Vec<ParsedNoteEntry> {
    let mut entries = Vec::new();
    for block in content.split("\n---\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let mut lines = block.lines();
        let Some(meta_line) = lines.next() else { continue };
        let Some((time, source_type, scope_key)) = parse_metadata_line(meta_line) else {
            continue;
        };

        let rest = lines.collect::<Vec<_>>().join("\n");
        let rest = rest.trim();
        let (title, body) = match rest.strip_prefix("**") {
            Some(after) => match after.split_once("**") {
                Some((title, body)) => (Some(title.trim().to_string()), body.trim().to_string()),
                None => (None, rest.to_string()),
            },
            None => (None, rest.to_string()),
        };

        entries.push(ParsedNoteEntry {
            time,
            source_type,
            scope_key,
            title,
            body,
        });
    }
    entries
}

/// Build the Prompt Builder's scope-filtered "recent notes" block from
/// today's and yesterday's daily-note files. Entries whose declared scope
/// doesn't match `scope_key` are dropped; the concatenated result is
/// truncated to `max_chars` with a trailing marker. Returns `None` when
/// neither file exists or nothing in scope was found.
pub fn build_recent_notes_block(workspace_dir: &Path, scope_key: &str, today: NaiveDate, max_chars: usize) -> Option<String> {
    let memory_dir = workspace_dir.join("memory");
    let mut snippet = String::new();

    for date in [today, today - chrono::Duration::days(1)] {
        let path = memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")));
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };

        let matching: Vec<ParsedNoteEntry> = parse_daily_note(&content)
            .into_iter()
            .filter(|e| e.scope_key == scope_key)
            .collect();
        if matching.is_empty() {
            continue;
        }

        snippet.push_str(&format!("### {}\n", date.format("%Y-%m-%d")));
        for entry in &matching {
            snippet.push_str(&format!("- [{}] {}\n", entry.time, entry.body));
        }
    }

    if snippet.is_empty() {
        return None;
    }

    if snippet.len() > max_chars {
        let cut = snippet
            .char_indices()
            .take_while(|(i, _)| *i < max_chars)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_chars.min(snippet.len()));
        snippet.truncate(cut);
        snippet.push_str("\n[... truncated ...]");
    }

    Some(snippet)
}

/// Appends entries to `memory/YYYY-MM-DD.md` under a workspace directory,
/// enforcing a per-day byte budget and indexing each write best-effort.
pub struct DailyNotesWriter {
    memory_dir: PathBuf,
    max_bytes_per_day: usize,
}

impl DailyNotesWriter {
    pub fn new(workspace_dir: &Path, max_bytes_per_day: usize) -> Self {
        Self {
            memory_dir: workspace_dir.join("memory"),
            max_bytes_per_day,
        }
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    fn file_path(&self, date: NaiveDate) -> PathBuf {
        self.memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// Append `entry` to `date`'s file. Rejects the write outright (no
    /// partial write) if it would push the file over the configured daily
    /// byte budget. On success, indexes the entry through `indexer` —
    /// indexing failures are logged and swallowed, never fail the write.
    pub fn append(
        &self,
        date: NaiveDate,
        entry: &NoteEntry,
        indexer: &DailyNotesIndexer,
    ) -> Result<(), MemoryWriteError> {
        std::fs::create_dir_all(&self.memory_dir)?;
        let path = self.file_path(date);

        let existing_len = std::fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
        let now = chrono::Utc::now();

        let mut block = String::new();
        if existing_len > 0 {
            block.push_str("\n---\n");
        }
        block.push_str(&format_metadata_line(&now.format("%H:%M").to_string(), entry.source_type, entry.scope_key));
        block.push('\n');
        if let Some(title) = entry.title {
            block.push_str("**");
            block.push_str(title);
            block.push_str("**\n");
        }
        block.push_str(entry.content.trim());
        block.push('\n');

        let projected_len = existing_len + block.len();
        if projected_len > self.max_bytes_per_day {
            return Err(MemoryWriteError::BudgetExceeded {
                date: date.format("%Y-%m-%d").to_string(),
                bytes: projected_len,
                budget: self.max_bytes_per_day,
            });
        }

        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(block.as_bytes())?;
        drop(file);

        if let Err(e) = indexer.index_daily_note(&path, date, entry) {
            warn!(error = %e, path = %path.display(), "daily_note_index_failed");
        }

        Ok(())
    }
}

/// A row read back from the `memory_entries` index.
#[derive(Debug, Clone)]
pub struct MemoryEntryRow {
    pub id: i64,
    pub scope_key: String,
    pub source_type: String,
    pub source_path: Option<String>,
    pub source_date: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntryRow> {
    let tags_csv: Option<String> = row.get(7)?;
    Ok(MemoryEntryRow {
        id: row.get(0)?,
        scope_key: row.get(1)?,
        source_type: row.get(2)?,
        source_path: row.get(3)?,
        source_date: row.get(4)?,
        title: row.get(5)?,
        content: row.get(6)?,
        tags: tags_csv
            .filter(|s| !s.is_empty())
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        confidence: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// FTS index over daily-note entries and curated memory, keyed by
/// `scope_key` for mandatory scope-filtered recall search.
pub struct DailyNotesIndexer {
    db: Mutex<Connection>,
}

impl DailyNotesIndexer {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    /// Index a single entry just appended to a daily note file. Idempotent
    /// on `source_path`: any rows previously indexed from this path are
    /// deleted before the fresh row is inserted, so re-running indexing
    /// against an already-indexed file never duplicates rows.
    pub fn index_daily_note(&self, path: &Path, date: NaiveDate, entry: &NoteEntry) -> Result<(), MemoryError> {
        self.delete_by_source_path(&path.to_string_lossy())?;
        self.insert_entry(
            entry.scope_key,
            entry.source_type,
            Some(&path.to_string_lossy()),
            Some(&date.format("%Y-%m-%d").to_string()),
            entry.title,
            entry.content,
            &[],
            0.5,
        )
    }

    /// Index a curated memory entry with no file behind it (no
    /// `source_path`, so no deduplication key — every call inserts a new
    /// row).
    pub fn index_curated_memory(
        &self,
        scope_key: &str,
        title: Option<&str>,
        content: &str,
        tags: &[String],
        confidence: f64,
    ) -> Result<(), MemoryError> {
        self.insert_entry(scope_key, "curated", None, None, title, content, tags, confidence)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        scope_key: &str,
        source_type: &str,
        source_path: Option<&str>,
        source_date: Option<&str>,
        title: Option<&str>,
        content: &str,
        tags: &[String],
        confidence: f64,
    ) -> Result<(), MemoryError> {
        let now = chrono::Utc::now().to_rfc3339();
        let tags_csv = tags.join(",");
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memory_entries
             (scope_key, source_type, source_path, source_date, title, content, tags, confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![scope_key, source_type, source_path, source_date, title, content, tags_csv, confidence, now],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO memory_entries_fts(rowid, title, content) VALUES (?1, ?2, ?3)",
            params![id, title, content],
        )?;
        Ok(())
    }

    fn delete_by_source_path(&self, source_path: &str) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT id, title, content FROM memory_entries WHERE source_path = ?1")?;
        let rows: Vec<(i64, Option<String>, String)> = stmt
            .query_map(params![source_path], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for (id, title, content) in rows {
            db.execute(
                "INSERT INTO memory_entries_fts(memory_entries_fts, rowid, title, content) VALUES('delete', ?1, ?2, ?3)",
                params![id, title, content],
            )?;
            db.execute("DELETE FROM memory_entries WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    /// Re-index every `memory/*.md` file under `workspace_dir` from
    /// scratch. Returns the number of entries indexed.
    pub fn reindex_all(&self, workspace_dir: &Path) -> Result<usize, MemoryError> {
        let memory_dir = workspace_dir.join("memory");
        let mut count = 0;
        let Ok(read_dir) = std::fs::read_dir(&memory_dir) else {
            return Ok(0);
        };

        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };

            self.delete_by_source_path(&path.to_string_lossy())?;
            for parsed in parse_daily_note(&content) {
                self.insert_entry(
                    &parsed.scope_key,
                    &parsed.source_type,
                    Some(&path.to_string_lossy()),
                    Some(&date.format("%Y-%m-%d").to_string()),
                    parsed.title.as_deref(),
                    &parsed.body,
                    &[],
                    0.5,
                )?;
                count += 1;
            }
        }

        Ok(count)
    }

    /// Scope-filtered FTS search. `scope_key` is mandatory — there is no
    /// call path that searches across scopes, by design: recall must never
    /// leak one peer's or channel's memory into another's context.
    pub fn search(&self, scope_key: &str, query: &str, limit: usize) -> Result<Vec<MemoryEntryRow>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT e.id, e.scope_key, e.source_type, e.source_path, e.source_date,
                    e.title, e.content, e.tags, e.confidence, e.created_at, e.updated_at
             FROM memory_entries e
             JOIN memory_entries_fts f ON e.id = f.rowid
             WHERE e.scope_key = ?1 AND memory_entries_fts MATCH ?2
             ORDER BY bm25(memory_entries_fts, 2.0, 1.0)
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![scope_key, query, limit as i64], row_to_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// True if any row has already been indexed from `source_path` —
    /// useful for callers deciding whether a reindex is needed.
    pub fn has_indexed(&self, source_path: &str) -> Result<bool, MemoryError> {
        let db = self.db.lock().unwrap();
        let exists: Option<i64> = db
            .query_row("SELECT 1 FROM memory_entries WHERE source_path = ?1 LIMIT 1", params![source_path], |r| r.get(0))
            .optional()?;
        Ok(exists.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_indexer(dir: &Path) -> (DailyNotesWriter, DailyNotesIndexer) {
        let writer = DailyNotesWriter::new(dir, 1_000_000);
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        (writer, DailyNotesIndexer::new(conn))
    }

    #[test]
    fn append_then_search_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, indexer) = writer_indexer(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();

        writer
            .append(
                date,
                &NoteEntry {
                    source_type: "compaction_flush",
                    scope_key: "telegram:peer:42",
                    title: None,
                    content: "User prefers dark mode always.",
                },
                &indexer,
            )
            .unwrap();

        let results = indexer.search("telegram:peer:42", "dark", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("dark mode"));
    }

    #[test]
    fn search_respects_scope_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, indexer) = writer_indexer(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();

        writer
            .append(
                date,
                &NoteEntry {
                    source_type: "compaction_flush",
                    scope_key: "peer:1",
                    title: None,
                    content: "Peer one's secret project name is Atlas.",
                },
                &indexer,
            )
            .unwrap();

        let leaked = indexer.search("peer:2", "Atlas", 10).unwrap();
        assert!(leaked.is_empty());
    }

    #[test]
    fn budget_exceeded_rejects_write() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DailyNotesWriter::new(dir.path(), 50);
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        let indexer = DailyNotesIndexer::new(conn);
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();

        let err = writer
            .append(
                date,
                &NoteEntry {
                    source_type: "compaction_flush",
                    scope_key: "main",
                    title: None,
                    content: "This content is long enough to blow straight through the tiny test budget.",
                },
                &indexer,
            )
            .unwrap_err();
        assert!(matches!(err, MemoryWriteError::BudgetExceeded { .. }));
    }

    #[test]
    fn reindexing_a_file_does_not_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, indexer) = writer_indexer(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();

        writer
            .append(date, &NoteEntry { source_type: "compaction_flush", scope_key: "main", title: None, content: "fact one" }, &indexer)
            .unwrap();
        writer
            .append(date, &NoteEntry { source_type: "compaction_flush", scope_key: "main", title: None, content: "fact two" }, &indexer)
            .unwrap();

        let indexed_before = indexer.search("main", "fact", 10).unwrap().len();
        indexer.reindex_all(dir.path()).unwrap();
        let indexed_after = indexer.search("main", "fact", 10).unwrap().len();
        assert_eq!(indexed_before, indexed_after);
    }

    #[test]
    fn parse_daily_note_splits_entries_and_defaults_scope() {
        let content = "[09:00] (source: compaction_flush, scope: peer:1)\nfirst entry\n---\n[10:30] (source: manual)\nsecond entry, no scope declared";
        let entries = parse_daily_note(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].scope_key, "peer:1");
        assert_eq!(entries[1].scope_key, "main");
    }

    #[test]
    fn recent_notes_block_filters_by_scope_and_spans_two_days() {
        let dir = tempfile::tempdir().unwrap();
        let memory_dir = dir.path().join("memory");
        std::fs::create_dir_all(&memory_dir).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        let yesterday = today - chrono::Duration::days(1);

        std::fs::write(
            memory_dir.join(format!("{}.md", today.format("%Y-%m-%d"))),
            "[09:00] (source: manual, scope: peer:1)\ntoday's note for peer 1\n---\n[09:05] (source: manual, scope: peer:2)\ntoday's note for peer 2",
        )
        .unwrap();
        std::fs::write(
            memory_dir.join(format!("{}.md", yesterday.format("%Y-%m-%d"))),
            "[18:00] (source: manual, scope: peer:1)\nyesterday's note for peer 1",
        )
        .unwrap();

        let block = build_recent_notes_block(dir.path(), "peer:1", today, 10_000).expect("notes in scope");
        assert!(block.contains("today's note for peer 1"));
        assert!(block.contains("yesterday's note for peer 1"));
        assert!(!block.contains("peer 2"));
    }

    #[test]
    fn recent_notes_block_none_when_nothing_in_scope() {
        let dir = tempfile::tempdir().unwrap();
        assert!(build_recent_notes_block(dir.path(), "peer:1", NaiveDate::from_ymd_opt(2026, 7, 26).unwrap(), 10_000).is_none());
    }
}
