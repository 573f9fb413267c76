//! Tracking store connection management
//!
//! One `TrackingStore` is opened at the start of a tick and closed at its end,
//! so no handle is held across the sleep between ticks.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use super::migrations::run_migrations;
use super::queries;
use crate::error::{RelayError, Result};
use crate::types::{Lifecycle, RelativePath, StoreStats, TrackedFile};

/// Durable per-file lifecycle records backed by SQLite
pub struct TrackingStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl TrackingStore {
    /// Open or create the store at `db_path`, applying pending migrations
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(&db_path, flags)?;
        Self::configure_pragmas(&conn)?;
        run_migrations(&conn)?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_pragmas(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Every committed mutation must survive a crash right after the call
    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA busy_timeout=30000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Track a successfully staged file.
    ///
    /// A second call for a known path changes nothing; use [`reacquire`]
    /// to fetch a file again. Returns `true` when a new record was created.
    ///
    /// [`reacquire`]: TrackingStore::reacquire
    pub fn record_download(&self, path: &RelativePath) -> Result<bool> {
        self.record_download_at(path, Utc::now())
    }

    pub fn record_download_at(&self, path: &RelativePath, at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| queries::insert_download(conn, path, at))
    }

    /// Forget a tracked file so the next discovery pass downloads it again.
    ///
    /// Only an actual download creates a record, so this drops the record
    /// instead of resetting it. Untracked paths fail with `NotFound`.
    pub fn reacquire(&self, path: &RelativePath) -> Result<()> {
        let removed = self.with_connection(|conn| queries::delete_file(conn, path))?;
        if !removed {
            return Err(RelayError::NotFound(path.to_string()));
        }
        tracing::info!(path = %path, "record dropped for re-acquisition");
        Ok(())
    }

    /// Every tracked path
    pub fn all_paths(&self) -> Result<Vec<RelativePath>> {
        self.with_connection(queries::list_paths)
    }

    /// Paths still waiting to be forwarded, oldest download first
    pub fn not_forwarded(&self) -> Result<Vec<RelativePath>> {
        self.with_connection(queries::list_not_forwarded)
    }

    /// Paths downloaded strictly before `cutoff`
    pub fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<RelativePath>> {
        self.with_connection(|conn| queries::list_older_than(conn, cutoff))
    }

    /// Set the forward time. A no-op when it is already set.
    pub fn mark_forwarded(&self, path: &RelativePath) -> Result<bool> {
        self.mark_forwarded_at(path, Utc::now())
    }

    pub fn mark_forwarded_at(&self, path: &RelativePath, at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| queries::set_forwarded(conn, path, at))
    }

    /// Set the delete time. A no-op unless the file is forwarded and not
    /// already marked deleted.
    pub fn mark_deleted(&self, path: &RelativePath) -> Result<bool> {
        self.mark_deleted_at(path, Utc::now())
    }

    pub fn mark_deleted_at(&self, path: &RelativePath, at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| queries::set_deleted(conn, path, at))
    }

    /// Errors with `NotFound` for an untracked path
    pub fn get_forward_time(&self, path: &RelativePath) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|conn| queries::get_forward_time(conn, path))
    }

    /// Errors with `NotFound` for an untracked path
    pub fn get_delete_time(&self, path: &RelativePath) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|conn| queries::get_delete_time(conn, path))
    }

    pub fn get(&self, path: &RelativePath) -> Result<Option<TrackedFile>> {
        self.with_connection(|conn| queries::get_file(conn, path))
    }

    pub fn list(&self, state: Option<Lifecycle>) -> Result<Vec<TrackedFile>> {
        self.with_connection(|conn| queries::list_files(conn, state))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_connection(queries::get_stats)
    }

    /// Purge records in one transaction. The caller checks the purge guard.
    ///
    /// Returns the number of records removed.
    pub fn remove<'a, I>(&self, paths: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a RelativePath>,
    {
        self.with_transaction(|conn| {
            let mut removed = 0;
            for path in paths {
                if queries::delete_file(conn, path)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Release the connection, surfacing any error from closing it
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        conn.close().map_err(|(_, e)| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_record_download_is_idempotent() {
        let store = TrackingStore::open_in_memory().unwrap();
        let a = path("in/a.txt");

        assert!(store.record_download(&a).unwrap());
        assert!(store.mark_forwarded(&a).unwrap());
        assert!(!store.record_download(&a).unwrap());

        assert_eq!(store.all_paths().unwrap(), vec![a.clone()]);
        assert!(store.get_forward_time(&a).unwrap().is_some());
    }

    #[test]
    fn test_reacquire_drops_record() {
        let store = TrackingStore::open_in_memory().unwrap();
        let a = path("a.txt");
        store.record_download(&a).unwrap();
        store.mark_forwarded(&a).unwrap();
        store.mark_deleted(&a).unwrap();

        store.reacquire(&a).unwrap();
        assert!(store.get(&a).unwrap().is_none());
        assert!(store.all_paths().unwrap().is_empty());

        // a fresh download starts the lifecycle over
        assert!(store.record_download(&a).unwrap());
        assert_eq!(store.get(&a).unwrap().unwrap().lifecycle(), Lifecycle::Downloaded);
    }

    #[test]
    fn test_reacquire_untracked_path_creates_nothing() {
        let store = TrackingStore::open_in_memory().unwrap();
        let a = path("never/seen.txt");

        let err = store.reacquire(&a).unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
        assert!(store.get(&a).unwrap().is_none());
        assert!(store.all_paths().unwrap().is_empty());
    }

    #[test]
    fn test_mark_forwarded_sets_once() {
        let store = TrackingStore::open_in_memory().unwrap();
        let a = path("a.txt");
        let first = Utc::now() - Duration::hours(1);
        store.record_download_at(&a, first).unwrap();

        assert!(store.mark_forwarded_at(&a, first).unwrap());
        assert!(!store.mark_forwarded_at(&a, Utc::now()).unwrap());
        assert_eq!(
            store.get_forward_time(&a).unwrap().map(|t| t.timestamp()),
            Some(first.timestamp())
        );
    }

    #[test]
    fn test_mark_deleted_requires_forward() {
        let store = TrackingStore::open_in_memory().unwrap();
        let a = path("a.txt");
        store.record_download(&a).unwrap();

        assert!(!store.mark_deleted(&a).unwrap());
        assert_eq!(store.get_delete_time(&a).unwrap(), None);

        store.mark_forwarded(&a).unwrap();
        assert!(store.mark_deleted(&a).unwrap());
        assert!(store.get_delete_time(&a).unwrap().is_some());
    }

    #[test]
    fn test_point_queries_on_unknown_path() {
        let store = TrackingStore::open_in_memory().unwrap();
        let err = store.get_forward_time(&path("missing.txt")).unwrap_err();
        assert!(matches!(err, crate::error::RelayError::NotFound(_)));
        assert!(store.get(&path("missing.txt")).unwrap().is_none());
        assert!(!store.mark_forwarded(&path("missing.txt")).unwrap());
    }

    #[test]
    fn test_older_than_and_not_forwarded() {
        let store = TrackingStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old = path("old.txt");
        let new = path("new.txt");
        store.record_download_at(&old, now - Duration::days(30)).unwrap();
        store.record_download_at(&new, now).unwrap();
        store.mark_forwarded(&new).unwrap();

        assert_eq!(store.older_than(now - Duration::days(7)).unwrap(), vec![old.clone()]);
        assert_eq!(store.not_forwarded().unwrap(), vec![old]);
    }

    #[test]
    fn test_remove_and_stats() {
        let store = TrackingStore::open_in_memory().unwrap();
        let a = path("a.txt");
        let b = path("b.txt");
        let c = path("c.txt");
        for p in [&a, &b, &c] {
            store.record_download(p).unwrap();
        }
        store.mark_forwarded(&b).unwrap();
        store.mark_forwarded(&c).unwrap();
        store.mark_deleted(&c).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(
            (stats.total, stats.pending, stats.forwarded, stats.locally_deleted),
            (3, 1, 1, 1)
        );
        assert_eq!(store.list(Some(Lifecycle::LocallyDeleted)).unwrap().len(), 1);

        assert_eq!(store.remove([&c, &path("ghost.txt")]).unwrap(), 1);
        assert_eq!(store.all_paths().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state/tracking.db");
        let a = path("x/a.bin");

        let store = TrackingStore::open(&db).unwrap();
        store.record_download(&a).unwrap();
        store.mark_forwarded(&a).unwrap();
        store.close().unwrap();

        let store = TrackingStore::open(&db).unwrap();
        assert_eq!(store.db_path(), db.as_path());
        let file = store.get(&a).unwrap().unwrap();
        assert_eq!(file.lifecycle(), Lifecycle::Forwarded);
    }
}
