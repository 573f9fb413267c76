//! Database queries for tracked files
//!
//! Timestamps are unix seconds; `0` is persisted for "not set" and mapped to
//! `None` on the way out.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{RelayError, Result};
use crate::types::{Lifecycle, RelativePath, StoreStats, TrackedFile};

const FILE_COLUMNS: &str = "file_path, download_date, forward_date, delete_date";

pub fn to_timestamp(at: DateTime<Utc>) -> i64 {
    // 0 means "unset", so a real timestamp is never allowed to collapse onto it
    at.timestamp().max(1)
}

pub fn from_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    if ts <= 0 {
        None
    } else {
        DateTime::from_timestamp(ts, 0)
    }
}

fn path_from_column(row: &Row, idx: usize) -> rusqlite::Result<RelativePath> {
    let raw: String = row.get(idx)?;
    RelativePath::new(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a tracked file from a database row
pub fn tracked_file_from_row(row: &Row) -> rusqlite::Result<TrackedFile> {
    let relative_path = path_from_column(row, 0)?;
    let download: Option<i64> = row.get(1)?;
    let forward: Option<i64> = row.get(2)?;
    let delete: Option<i64> = row.get(3)?;

    Ok(TrackedFile {
        relative_path,
        // legacy rows may carry 0 here; treat them as downloaded at the epoch
        download_time: from_timestamp(download.unwrap_or(0)).unwrap_or(DateTime::UNIX_EPOCH),
        forward_time: forward.and_then(from_timestamp),
        delete_time: delete.and_then(from_timestamp),
    })
}

fn collect_paths(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RelativePath>> {
    let mut stmt = conn.prepare(sql)?;
    let paths = stmt
        .query_map(args, |row| path_from_column(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(paths)
}

/// Insert a freshly downloaded file. Existing records are left untouched.
///
/// Returns `true` if a record was created.
pub fn insert_download(conn: &Connection, path: &RelativePath, at: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO files (file_path, download_date, forward_date, delete_date)
         VALUES (?1, ?2, 0, 0)
         ON CONFLICT(file_path) DO NOTHING",
        params![path.as_str(), to_timestamp(at)],
    )?;
    Ok(inserted > 0)
}

pub fn list_paths(conn: &Connection) -> Result<Vec<RelativePath>> {
    collect_paths(conn, "SELECT file_path FROM files ORDER BY file_path", &[])
}

pub fn list_not_forwarded(conn: &Connection) -> Result<Vec<RelativePath>> {
    collect_paths(
        conn,
        "SELECT file_path FROM files WHERE forward_date = 0 ORDER BY download_date, file_path",
        &[],
    )
}

pub fn list_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<RelativePath>> {
    collect_paths(
        conn,
        "SELECT file_path FROM files WHERE download_date < ?1 ORDER BY download_date, file_path",
        &[&cutoff.timestamp()],
    )
}

pub fn get_file(conn: &Connection, path: &RelativePath) -> Result<Option<TrackedFile>> {
    let file = conn
        .query_row(
            &format!("SELECT {} FROM files WHERE file_path = ?1", FILE_COLUMNS),
            params![path.as_str()],
            tracked_file_from_row,
        )
        .optional()?;
    Ok(file)
}

fn get_time_column(conn: &Connection, path: &RelativePath, column: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<Option<i64>> = conn
        .query_row(
            &format!("SELECT {} FROM files WHERE file_path = ?1", column),
            params![path.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(ts) => Ok(ts.and_then(from_timestamp)),
        None => Err(RelayError::NotFound(path.to_string())),
    }
}

pub fn get_forward_time(conn: &Connection, path: &RelativePath) -> Result<Option<DateTime<Utc>>> {
    get_time_column(conn, path, "forward_date")
}

pub fn get_delete_time(conn: &Connection, path: &RelativePath) -> Result<Option<DateTime<Utc>>> {
    get_time_column(conn, path, "delete_date")
}

/// Set the forward time once. Returns `false` if already set or unknown.
pub fn set_forwarded(conn: &Connection, path: &RelativePath, at: DateTime<Utc>) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE files SET forward_date = ?1 WHERE file_path = ?2 AND forward_date = 0",
        params![to_timestamp(at), path.as_str()],
    )?;
    Ok(updated > 0)
}

/// Set the delete time once, only for forwarded files.
pub fn set_deleted(conn: &Connection, path: &RelativePath, at: DateTime<Utc>) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE files SET delete_date = ?1
         WHERE file_path = ?2 AND forward_date <> 0 AND delete_date = 0",
        params![to_timestamp(at), path.as_str()],
    )?;
    Ok(updated > 0)
}

pub fn delete_file(conn: &Connection, path: &RelativePath) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM files WHERE file_path = ?1",
        params![path.as_str()],
    )?;
    Ok(deleted > 0)
}

/// List full records, optionally restricted to one lifecycle state
pub fn list_files(conn: &Connection, state: Option<Lifecycle>) -> Result<Vec<TrackedFile>> {
    let filter = match state {
        None => "",
        Some(Lifecycle::Downloaded) => "WHERE forward_date = 0",
        Some(Lifecycle::Forwarded) => "WHERE forward_date <> 0 AND delete_date = 0",
        Some(Lifecycle::LocallyDeleted) => "WHERE forward_date <> 0 AND delete_date <> 0",
    };
    let sql = format!(
        "SELECT {} FROM files {} ORDER BY download_date, file_path",
        FILE_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let files = stmt
        .query_map([], tracked_file_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
}

pub fn get_stats(conn: &Connection) -> Result<StoreStats> {
    let stats = conn.query_row(
        "SELECT
            COUNT(*),
            COALESCE(SUM(CASE WHEN forward_date = 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN forward_date <> 0 AND delete_date = 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN forward_date <> 0 AND delete_date <> 0 THEN 1 ELSE 0 END), 0),
            MIN(download_date),
            MAX(download_date)
         FROM files",
        [],
        |row| {
            let oldest: Option<i64> = row.get(4)?;
            let newest: Option<i64> = row.get(5)?;
            Ok(StoreStats {
                total: row.get(0)?,
                pending: row.get(1)?,
                forwarded: row.get(2)?,
                locally_deleted: row.get(3)?,
                oldest_download: oldest.and_then(from_timestamp),
                newest_download: newest.and_then(from_timestamp),
            })
        },
    )?;
    Ok(stats)
}
