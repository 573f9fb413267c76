//! Database migrations for the tracking store

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
///
/// Same layout as databases written by the earlier collector scripts, so an
/// existing `files` table is adopted as-is.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            file_path TEXT UNIQUE NOT NULL,
            download_date INTEGER DEFAULT 0,
            forward_date INTEGER DEFAULT 0
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;
    Ok(())
}

/// Local deletion tracking (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "files", "delete_date")? {
        conn.execute(
            "ALTER TABLE files ADD COLUMN delete_date INTEGER DEFAULT 0",
            [],
        )?;
    }

    conn.execute_batch(
        r#"
        UPDATE files SET forward_date = 0 WHERE forward_date IS NULL;
        UPDATE files SET delete_date = 0 WHERE delete_date IS NULL;

        CREATE INDEX IF NOT EXISTS idx_files_download_date ON files(download_date);
        CREATE INDEX IF NOT EXISTS idx_files_forward_date ON files(forward_date);

        INSERT OR IGNORE INTO schema_version (version) VALUES (2);
        "#,
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}
