//! SQLite schemas
//!
//! Two kinds of database live in the data directory: one project directory
//! (`projects.db`) and one annotation database per project
//! (`annot-<uuid>.db`). Column names are shared with other clients that
//! read the same files, so they are part of the external interface.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the annotation database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Comments; content columns are NULL once tombstoned
        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            comment TEXT,
            timestamp_updated REAL,
            timestamp_created REAL,
            user_created TEXT,
            deleted INTEGER NOT NULL DEFAULT 0
        );

        -- Threads; anchor and file_path are NULL once tombstoned
        CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            anchor TEXT,
            file_path TEXT,
            deleted INTEGER NOT NULL DEFAULT 0
        );

        -- Findings from analysis runs (no tombstones)
        CREATE TABLE IF NOT EXISTS diagnostics (
            id TEXT PRIMARY KEY,
            diagnostic TEXT NOT NULL,
            flag INTEGER NOT NULL DEFAULT 0,
            flag_timestamp REAL NOT NULL,
            anchor TEXT NOT NULL,
            file_path TEXT NOT NULL,
            timestamp_created REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_comments_thread_id ON comments(thread_id);
        CREATE INDEX IF NOT EXISTS idx_comments_deleted ON comments(deleted);
        CREATE INDEX IF NOT EXISTS idx_threads_deleted ON threads(deleted);
        "#,
    )?;

    set_schema_version(conn)
}

/// Initialize the project directory schema
pub fn init_projects_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
            uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            keys TEXT NULL,
            jwt TEXT NULL DEFAULT NULL,
            deleted INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;

    set_schema_version(conn)
}

fn set_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

/// Drop every annotation table (used when a project is removed)
pub fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS comments;
        DROP TABLE IF EXISTS threads;
        DROP TABLE IF EXISTS diagnostics;
        DROP TABLE IF EXISTS schema_info;
        "#,
    )
}
