//! Local annotation store
//!
//! One SQLite database per project holding threads, comments and findings.
//! Threads and comments are never physically removed by normal operation:
//! deleting one clears its content and leaves a tombstone so the deletion can
//! propagate to peers.
//!
//! ## Lifecycle
//!
//! `new` → `init` (ready) → `close` (not ready). Outside the ready window every
//! operation logs a warning and returns an empty result instead of failing,
//! so late callbacks after a project is closed are harmless.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{drop_all_tables, init_schema, needs_init};
use crate::anchor::Anchor;
use crate::models::{Comment, DiagnosticPayload, Finding, Flag, Thread};

/// A live thread with its live comments, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveThread {
    pub thread: Thread,
    pub comments: Vec<Comment>,
}

/// Ids of tombstoned rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tombstones {
    /// Tombstoned thread ids
    pub threads: Vec<Uuid>,
    /// Tombstoned comments as (comment id, thread id)
    pub comments: Vec<(Uuid, Uuid)>,
}

impl Tombstones {
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty() && self.comments.is_empty()
    }
}

/// SQLite-backed store for one project's annotations
pub struct LocalStore {
    path: Option<PathBuf>,
    conn: Option<Connection>,
}

impl LocalStore {
    /// Create a store for the database at `path` (not ready until `init`)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            conn: None,
        }
    }

    /// Open a ready in-memory store (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Some(conn),
        })
    }

    /// Open the database file and create tables if needed
    pub fn init(&mut self) -> StorageResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path).map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        debug!("Opened local store at {:?}", path);
        self.conn = Some(conn);
        Ok(())
    }

    /// Close the database; later operations become no-ops
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close local store cleanly: {}", e);
            }
        }
    }

    /// Whether the store is between `init` and `close`
    pub fn is_ready(&self) -> bool {
        self.conn.is_some()
    }

    /// Database file path (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self, op: &str) -> Option<&Connection> {
        if self.conn.is_none() {
            warn!("Local store is not ready, skipping {}", op);
        }
        self.conn.as_ref()
    }

    // ==================== Threads ====================

    /// Create or replace a thread row
    pub fn upsert_thread(&self, thread: &Thread) -> StorageResult<()> {
        let Some(conn) = self.conn("upsert_thread") else {
            return Ok(());
        };

        conn.execute(
            "INSERT OR REPLACE INTO threads (id, anchor, file_path, deleted) VALUES (?1, ?2, ?3, ?4)",
            params![
                thread.id.to_string(),
                thread.anchor.encode(),
                thread.file_path,
                thread.deleted,
            ],
        )?;
        Ok(())
    }

    /// Get a thread by id, live or tombstoned
    pub fn thread(&self, id: &Uuid) -> StorageResult<Option<Thread>> {
        let Some(conn) = self.conn("thread") else {
            return Ok(None);
        };

        let row = conn
            .query_row(
                "SELECT id, anchor, file_path, deleted FROM threads WHERE id = ?",
                params![id.to_string()],
                ThreadRow::from_row,
            )
            .optional()?;

        row.map(ThreadRow::into_thread).transpose()
    }

    /// Tombstone a thread, then tombstone every comment left without a live thread
    ///
    /// Returns whether a live thread was tombstoned.
    pub fn tombstone_thread(&self, id: &Uuid, at: f64) -> StorageResult<bool> {
        let Some(conn) = self.conn("tombstone_thread") else {
            return Ok(false);
        };

        let changed = conn.execute(
            "UPDATE threads SET anchor = NULL, file_path = NULL, deleted = 1 WHERE id = ? AND deleted = 0",
            params![id.to_string()],
        )?;
        self.sweep_orphans(at)?;
        Ok(changed > 0)
    }

    /// Tombstone live comments whose thread is tombstoned or missing
    pub fn sweep_orphans(&self, at: f64) -> StorageResult<usize> {
        let Some(conn) = self.conn("sweep_orphans") else {
            return Ok(0);
        };

        let swept = conn.execute(
            r#"
            UPDATE comments
            SET comment = NULL, user_created = NULL, timestamp_created = NULL,
                timestamp_updated = ?1, deleted = 1
            WHERE deleted = 0
              AND thread_id NOT IN (SELECT id FROM threads WHERE deleted = 0)
            "#,
            params![at],
        )?;
        if swept > 0 {
            debug!("Swept {} orphaned comment(s)", swept);
        }
        Ok(swept)
    }

    /// All live threads with their live comments
    pub fn list_active(&self) -> StorageResult<Vec<ActiveThread>> {
        let Some(conn) = self.conn("list_active") else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, anchor, file_path, deleted FROM threads WHERE deleted = 0 ORDER BY file_path",
        )?;
        let threads = stmt
            .query_map([], ThreadRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, thread_id, comment, timestamp_updated, timestamp_created, user_created, deleted
            FROM comments
            WHERE deleted = 0
            ORDER BY timestamp_created
            "#,
        )?;
        let comment_rows = stmt
            .query_map([], CommentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut comments: HashMap<Uuid, Vec<Comment>> = HashMap::new();
        for row in comment_rows {
            let comment = row.into_comment()?;
            comments.entry(comment.thread_id).or_default().push(comment);
        }

        threads
            .into_iter()
            .map(|row| {
                let thread = row.into_thread()?;
                let comments = comments.remove(&thread.id).unwrap_or_default();
                Ok(ActiveThread { thread, comments })
            })
            .collect()
    }

    // ==================== Comments ====================

    /// Create or replace a comment row
    ///
    /// The owning thread must exist and be live.
    pub fn upsert_comment(&self, comment: &Comment) -> StorageResult<()> {
        let Some(conn) = self.conn("upsert_comment") else {
            return Ok(());
        };

        let live: Option<bool> = conn
            .query_row(
                "SELECT deleted = 0 FROM threads WHERE id = ?",
                params![comment.thread_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if live != Some(true) {
            return Err(StorageError::missing("live thread", comment.thread_id));
        }

        conn.execute(
            r#"
            INSERT OR REPLACE INTO comments
                (id, thread_id, comment, timestamp_updated, timestamp_created, user_created, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                comment.id.to_string(),
                comment.thread_id.to_string(),
                comment.body,
                comment.last_modified,
                comment.created,
                comment.author,
                comment.deleted,
            ],
        )?;
        Ok(())
    }

    /// Get a comment by id, live or tombstoned
    pub fn comment(&self, id: &Uuid) -> StorageResult<Option<Comment>> {
        let Some(conn) = self.conn("comment") else {
            return Ok(None);
        };

        let row = conn
            .query_row(
                r#"
                SELECT id, thread_id, comment, timestamp_updated, timestamp_created, user_created, deleted
                FROM comments WHERE id = ?
                "#,
                params![id.to_string()],
                CommentRow::from_row,
            )
            .optional()?;

        row.map(CommentRow::into_comment).transpose()
    }

    /// Ids of the live comments of a thread
    pub fn comment_ids_for_thread(&self, thread_id: &Uuid) -> StorageResult<Vec<Uuid>> {
        let Some(conn) = self.conn("comment_ids_for_thread") else {
            return Ok(Vec::new());
        };

        let mut stmt =
            conn.prepare("SELECT id FROM comments WHERE thread_id = ? AND deleted = 0")?;
        let ids = stmt
            .query_map(params![thread_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter().map(|id| parse_uuid("comments", id)).collect()
    }

    /// Tombstone one comment
    ///
    /// Returns whether a live comment was tombstoned.
    pub fn tombstone_comment(&self, id: &Uuid, at: f64) -> StorageResult<bool> {
        self.tombstone_comments(std::slice::from_ref(id), at)
            .map(|n| n > 0)
    }

    /// Tombstone several comments, returning how many were live
    pub fn tombstone_comments(&self, ids: &[Uuid], at: f64) -> StorageResult<usize> {
        let Some(conn) = self.conn("tombstone_comments") else {
            return Ok(0);
        };

        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE comments
                SET comment = NULL, user_created = NULL, timestamp_created = NULL,
                    timestamp_updated = ?1, deleted = 1
                WHERE id = ?2 AND deleted = 0
                "#,
            )?;
            for id in ids {
                changed += stmt.execute(params![at, id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    // ==================== Tombstones ====================

    /// Ids of every tombstoned thread
    pub fn tombstoned_thread_ids(&self) -> StorageResult<Vec<Uuid>> {
        let Some(conn) = self.conn("tombstoned_thread_ids") else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare("SELECT id FROM threads WHERE deleted = 1")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter().map(|id| parse_uuid("threads", id)).collect()
    }

    /// Every tombstoned comment as (comment id, thread id)
    pub fn tombstoned_comments(&self) -> StorageResult<Vec<(Uuid, Uuid)>> {
        self.tombstoned_comments_since(None)
    }

    fn tombstoned_comments_since(&self, since: Option<f64>) -> StorageResult<Vec<(Uuid, Uuid)>> {
        let Some(conn) = self.conn("tombstoned_comments") else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT id, thread_id FROM comments
            WHERE deleted = 1
              AND (?1 IS NULL OR timestamp_updated IS NULL OR timestamp_updated > ?1)
            "#,
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|(cid, tid)| Ok((parse_uuid("comments", cid)?, parse_uuid("comments", tid)?)))
            .collect()
    }

    /// All tombstones
    pub fn list_all_tombstoned(&self) -> StorageResult<Tombstones> {
        Ok(Tombstones {
            threads: self.tombstoned_thread_ids()?,
            comments: self.tombstoned_comments()?,
        })
    }

    /// Tombstones newer than `since`
    ///
    /// Threads carry no timestamp of their own, so every tombstoned thread is
    /// included.
    pub fn list_tombstoned_since(&self, since: f64) -> StorageResult<Tombstones> {
        Ok(Tombstones {
            threads: self.tombstoned_thread_ids()?,
            comments: self.tombstoned_comments_since(Some(since))?,
        })
    }

    /// Physically remove tombstoned rows
    pub fn prune_tombstones(&self) -> StorageResult<usize> {
        let Some(conn) = self.conn("prune_tombstones") else {
            return Ok(0);
        };

        let tx = conn.unchecked_transaction()?;
        let comments = tx.execute("DELETE FROM comments WHERE deleted = 1", [])?;
        let threads = tx.execute("DELETE FROM threads WHERE deleted = 1", [])?;
        tx.commit()?;
        Ok(comments + threads)
    }

    // ==================== Findings ====================

    /// All findings, grouped by file
    pub fn list_findings(&self) -> StorageResult<Vec<Finding>> {
        let Some(conn) = self.conn("list_findings") else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT id, diagnostic, flag, flag_timestamp, anchor, file_path, timestamp_created
            FROM diagnostics
            ORDER BY file_path, timestamp_created
            "#,
        )?;
        let rows = stmt
            .query_map([], FindingRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(FindingRow::into_finding).collect()
    }

    /// Get a finding by id
    pub fn finding(&self, id: &Uuid) -> StorageResult<Option<Finding>> {
        let Some(conn) = self.conn("finding") else {
            return Ok(None);
        };

        let row = conn
            .query_row(
                r#"
                SELECT id, diagnostic, flag, flag_timestamp, anchor, file_path, timestamp_created
                FROM diagnostics WHERE id = ?
                "#,
                params![id.to_string()],
                FindingRow::from_row,
            )
            .optional()?;
        row.map(FindingRow::into_finding).transpose()
    }

    /// Create or replace a finding
    pub fn upsert_finding(&self, finding: &Finding) -> StorageResult<()> {
        let Some(conn) = self.conn("upsert_finding") else {
            return Ok(());
        };
        insert_finding(conn, finding)
    }

    /// Replace every finding with `findings` in one transaction
    pub fn replace_findings(&self, findings: &[Finding]) -> StorageResult<()> {
        let Some(conn) = self.conn("replace_findings") else {
            return Ok(());
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM diagnostics", [])?;
        for finding in findings {
            insert_finding(&tx, finding)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Change a finding's flag, returning whether the finding exists
    pub fn update_finding_flag(&self, id: &Uuid, flag: Flag, at: f64) -> StorageResult<bool> {
        let Some(conn) = self.conn("update_finding_flag") else {
            return Ok(false);
        };

        let changed = conn.execute(
            "UPDATE diagnostics SET flag = ?1, flag_timestamp = ?2 WHERE id = ?3",
            params![u8::from(flag), at, id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Delete one finding
    pub fn delete_finding(&self, id: &Uuid) -> StorageResult<bool> {
        let Some(conn) = self.conn("delete_finding") else {
            return Ok(false);
        };

        let changed = conn.execute(
            "DELETE FROM diagnostics WHERE id = ?",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Delete every finding
    pub fn clear_findings(&self) -> StorageResult<usize> {
        let Some(conn) = self.conn("clear_findings") else {
            return Ok(0);
        };
        Ok(conn.execute("DELETE FROM diagnostics", [])?)
    }

    // ==================== Maintenance ====================

    /// Drop every table and close the store
    pub fn drop_all(&mut self) -> StorageResult<()> {
        if let Some(conn) = self.conn("drop_all") {
            drop_all_tables(conn)?;
        }
        self.close();
        Ok(())
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn insert_finding(conn: &Connection, finding: &Finding) -> StorageResult<()> {
    let diagnostic = serde_json::to_string(&finding.diagnostic).map_err(|e| {
        StorageError::InvalidRow {
            table: "diagnostics",
            details: e.to_string(),
        }
    })?;

    conn.execute(
        r#"
        INSERT OR REPLACE INTO diagnostics
            (id, diagnostic, flag, flag_timestamp, anchor, file_path, timestamp_created)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            finding.id.to_string(),
            diagnostic,
            u8::from(finding.flag),
            finding.flag_timestamp,
            finding.anchor.encode(),
            finding.file_path,
            finding.created,
        ],
    )?;
    Ok(())
}

fn parse_uuid(table: &'static str, raw: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::InvalidRow {
        table,
        details: format!("bad id '{}': {}", raw, e),
    })
}

/// Decode a stored anchor; a damaged anchor degrades to line 0
fn decode_anchor(table: &'static str, id: &str, raw: Option<&str>) -> Anchor {
    match raw.map(Anchor::decode) {
        Some(Ok(anchor)) => anchor,
        Some(Err(e)) => {
            error!("Malformed anchor on {} {}: {}", table, id, e);
            Anchor::default()
        }
        None => Anchor::default(),
    }
}

// ==================== Row types ====================

struct ThreadRow {
    id: String,
    anchor: Option<String>,
    file_path: Option<String>,
    deleted: bool,
}

impl ThreadRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            anchor: row.get(1)?,
            file_path: row.get(2)?,
            deleted: row.get(3)?,
        })
    }

    fn into_thread(self) -> StorageResult<Thread> {
        Ok(Thread {
            id: parse_uuid("threads", &self.id)?,
            anchor: decode_anchor("thread", &self.id, self.anchor.as_deref()),
            file_path: self.file_path.unwrap_or_default(),
            deleted: self.deleted,
        })
    }
}

struct CommentRow {
    id: String,
    thread_id: String,
    body: Option<String>,
    updated: Option<f64>,
    created: Option<f64>,
    author: Option<String>,
    deleted: bool,
}

impl CommentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            body: row.get(2)?,
            updated: row.get(3)?,
            created: row.get(4)?,
            author: row.get(5)?,
            deleted: row.get(6)?,
        })
    }

    fn into_comment(self) -> StorageResult<Comment> {
        Ok(Comment {
            id: parse_uuid("comments", &self.id)?,
            thread_id: parse_uuid("comments", &self.thread_id)?,
            body: self.body.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            last_modified: self.updated.unwrap_or_default(),
            created: self.created.unwrap_or_default(),
            deleted: self.deleted,
        })
    }
}

struct FindingRow {
    id: String,
    diagnostic: String,
    flag: u8,
    flag_timestamp: f64,
    anchor: String,
    file_path: String,
    created: f64,
}

impl FindingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            diagnostic: row.get(1)?,
            flag: row.get(2)?,
            flag_timestamp: row.get(3)?,
            anchor: row.get(4)?,
            file_path: row.get(5)?,
            created: row.get(6)?,
        })
    }

    fn into_finding(self) -> StorageResult<Finding> {
        let diagnostic: DiagnosticPayload =
            serde_json::from_str(&self.diagnostic).map_err(|e| StorageError::InvalidRow {
                table: "diagnostics",
                details: e.to_string(),
            })?;
        let flag = Flag::try_from(self.flag).map_err(|details| StorageError::InvalidRow {
            table: "diagnostics",
            details,
        })?;

        Ok(Finding {
            id: parse_uuid("diagnostics", &self.id)?,
            anchor: decode_anchor("finding", &self.id, Some(&self.anchor)),
            diagnostic,
            file_path: self.file_path,
            flag,
            flag_timestamp: self.flag_timestamp,
            created: self.created,
        })
    }
}
