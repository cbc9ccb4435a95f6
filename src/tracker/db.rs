//! SQLite-backed photo tracker.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::backup;
use super::error::TrackerError;
use super::schema;
use super::types::{PhotoRecord, TrackerBackup, TrackerStats};

/// Durable store mapping `(filename, album_name)` to a [`PhotoRecord`].
///
/// The tracker is the single writer for its file. All operations serialize
/// through the connection mutex; `rusqlite::Connection` is not `Sync`, the
/// same arrangement the store uses for any concurrent readers.
pub struct Tracker {
    /// All operations lock this; none hold it across an await point.
    conn: Mutex<Connection>,
    /// Path to the live database file.
    db_path: PathBuf,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Open or create the tracker at `db_path`.
    ///
    /// Runs an integrity check first. A corrupt live file is sidelined and
    /// the newest valid backup restored; with no usable backup a fresh
    /// empty store is created and the event logged. Only a failure to
    /// create even a fresh store is fatal.
    pub async fn open(db_path: &Path) -> Result<Self, TrackerError> {
        let path = db_path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&path)).await?
    }

    fn open_blocking(db_path: &Path) -> Result<Self, TrackerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrackerError::Unavailable {
                path: db_path.to_path_buf(),
                reason: format!("cannot create parent directory: {}", e),
            })?;
        }

        let mut fresh = !db_path.exists();

        if !fresh && !backup::integrity_ok(db_path) {
            tracing::warn!(
                "Tracker corruption detected at {}, attempting recovery",
                db_path.display()
            );
            match backup::restore_newest_valid(db_path)? {
                Some(_) => {}
                None => {
                    tracing::error!("Tracker recovery failed, creating a fresh store");
                    if db_path.exists() {
                        backup::sideline_corrupt(db_path);
                    }
                    fresh = true;
                }
            }
        }

        let conn = match Self::open_connection(db_path) {
            Ok(conn) => conn,
            Err(e @ TrackerError::UnsupportedSchemaVersion { .. }) => return Err(e),
            Err(e) if !fresh => {
                // Restored or existing file would not open; last resort is
                // a fresh store.
                tracing::error!("Tracker failed to open after recovery: {}", e);
                backup::sideline_corrupt(db_path);
                fresh = true;
                Self::open_connection(db_path).map_err(|e| TrackerError::Unavailable {
                    path: db_path.to_path_buf(),
                    reason: e.to_string(),
                })?
            }
            Err(e) => {
                return Err(TrackerError::Unavailable {
                    path: db_path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        let tracker = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };

        if fresh {
            // First backup right away so recovery has a floor to land on.
            if let Err(e) = tracker.backup_locked(&*tracker.lock()?) {
                tracing::warn!("Initial tracker backup failed: {}", e);
            }
        }

        Ok(tracker)
    }

    fn open_connection(db_path: &Path) -> Result<Connection, TrackerError> {
        let conn = Connection::open(db_path).map_err(TrackerError::Migration)?;
        // WAL + NORMAL: safe with WAL, and readers never block the writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::migrate(&conn)?;
        Ok(conn)
    }

    /// Open an in-memory tracker (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, TrackerError> {
        let conn = Connection::open_in_memory().map_err(TrackerError::Migration)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Path of the live database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, TrackerError> {
        self.conn
            .lock()
            .map_err(|e| TrackerError::Query(e.to_string()))
    }

    /// Look up the record for `(filename, album_name)`.
    pub async fn get(
        &self,
        filename: &str,
        album_name: &str,
    ) -> Result<Option<PhotoRecord>, TrackerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT filename, album_name, remote_id, size_bytes, local_relpath,
                    downloaded_at, last_checked_at, deleted_locally
             FROM photos WHERE filename = ?1 AND album_name = ?2",
            [filename, album_name],
            row_to_record,
        )
        .optional()
        .map_err(TrackerError::query)
    }

    /// Insert or update a record after a successful download.
    ///
    /// Clears `deleted_locally` and stamps `downloaded_at` with now.
    pub async fn record_download(
        &self,
        filename: &str,
        album_name: &str,
        remote_id: &str,
        size_bytes: u64,
        local_relpath: &str,
    ) -> Result<(), TrackerError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO photos
                (filename, album_name, remote_id, size_bytes, local_relpath,
                 downloaded_at, last_checked_at, deleted_locally)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)
            ON CONFLICT(filename, album_name) DO UPDATE SET
                remote_id = excluded.remote_id,
                size_bytes = excluded.size_bytes,
                local_relpath = excluded.local_relpath,
                downloaded_at = excluded.downloaded_at,
                last_checked_at = excluded.last_checked_at,
                deleted_locally = 0
            "#,
            rusqlite::params![
                filename,
                album_name,
                remote_id,
                size_bytes as i64,
                local_relpath,
                now,
            ],
        )
        .map_err(TrackerError::write)?;
        Ok(())
    }

    /// Flag the record as deleted locally, preserving the other fields.
    pub async fn mark_deleted(&self, filename: &str, album_name: &str) -> Result<(), TrackerError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE photos SET deleted_locally = 1, last_checked_at = ?1
                 WHERE filename = ?2 AND album_name = ?3",
                rusqlite::params![now, filename, album_name],
            )
            .map_err(TrackerError::write)?;
        if rows == 0 {
            tracing::debug!(
                "mark_deleted for untracked key ({}, {})",
                filename,
                album_name
            );
        }
        Ok(())
    }

    /// Update `last_checked_at` only.
    pub async fn touch_seen(&self, filename: &str, album_name: &str) -> Result<(), TrackerError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE photos SET last_checked_at = ?1
             WHERE filename = ?2 AND album_name = ?3",
            rusqlite::params![now, filename, album_name],
        )
        .map_err(TrackerError::write)?;
        Ok(())
    }

    /// All records for one album, ordered by filename.
    pub async fn photos_in_album(&self, album_name: &str) -> Result<Vec<PhotoRecord>, TrackerError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT filename, album_name, remote_id, size_bytes, local_relpath,
                        downloaded_at, last_checked_at, deleted_locally
                 FROM photos WHERE album_name = ?1 ORDER BY filename",
            )
            .map_err(TrackerError::query)?;
        let records = stmt
            .query_map([album_name], row_to_record)
            .map_err(TrackerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(TrackerError::query)?;
        Ok(records)
    }

    /// Counters for the cycle summary.
    pub async fn stats(&self) -> Result<TrackerStats, TrackerError> {
        let conn = self.lock()?;
        let (total, deleted, downloaded) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(deleted_locally), 0),
                        COALESCE(SUM(CASE WHEN downloaded_at IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM photos",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .map_err(TrackerError::query)?;
        Ok(TrackerStats {
            total_records: total as u64,
            deleted_locally: deleted as u64,
            downloaded: downloaded as u64,
        })
    }

    /// Copy the live file into the backup ring.
    ///
    /// The connection mutex is held for the duration so the copy observes
    /// a quiesced file; the WAL is checkpointed into the main file first.
    pub async fn backup(&self) -> Result<TrackerBackup, TrackerError> {
        let conn = self.lock()?;
        self.backup_locked(&conn)
    }

    fn backup_locked(&self, conn: &Connection) -> Result<TrackerBackup, TrackerError> {
        if self.db_path.as_os_str() == ":memory:" {
            return Err(TrackerError::WriteFailed(
                "cannot back up an in-memory tracker".into(),
            ));
        }
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(TrackerError::write)?;
        backup::create_backup(&self.db_path, backup::BACKUP_RETENTION)
    }

    /// Run an integrity check against the open store.
    pub async fn check_integrity(&self) -> Result<bool, TrackerError> {
        let conn = self.lock()?;
        let result: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(TrackerError::query)?;
        Ok(result == "ok")
    }

    /// Replace the live store with the newest backup whose integrity check
    /// passes. Returns false when no usable backup exists.
    pub async fn restore_from_backup(&self) -> Result<bool, TrackerError> {
        let mut conn = self.lock()?;
        // Release the file before swapping it out from under SQLite.
        let placeholder = Connection::open_in_memory().map_err(TrackerError::Migration)?;
        let _old = std::mem::replace(&mut *conn, placeholder);
        drop(_old);

        let restored = backup::restore_newest_valid(&self.db_path)?;
        let reopened = Self::open_connection(&self.db_path).map_err(|e| {
            TrackerError::Unavailable {
                path: self.db_path.clone(),
                reason: e.to_string(),
            }
        })?;
        *conn = reopened;
        Ok(restored.is_some())
    }

    /// Flush and close the store. Dropping the tracker also closes it;
    /// this form makes the checkpoint explicit at shutdown.
    pub fn close(self) {
        if let Ok(conn) = self.conn.lock() {
            let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhotoRecord> {
    let downloaded_at: Option<i64> = row.get(5)?;
    let last_checked_at: i64 = row.get(6)?;
    let deleted: i64 = row.get(7)?;
    Ok(PhotoRecord {
        filename: row.get(0)?,
        album_name: row.get(1)?,
        remote_id: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        local_relpath: row.get(4)?,
        downloaded_at: downloaded_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        last_checked_at: Utc
            .timestamp_opt(last_checked_at, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        deleted_locally: deleted != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_creates_db() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deletion_tracker.db");
        let tracker = Tracker::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(tracker.db_path(), path);
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let tracker = Tracker::open_in_memory().unwrap();
        let record = tracker.get("IMG_1.JPG", "Trip").await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn record_download_round_trip() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();

        let record = tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert_eq!(record.remote_id, "r1");
        assert_eq!(record.size_bytes, 1024);
        assert_eq!(record.local_relpath, "Trip/IMG_1.JPG");
        assert!(!record.deleted_locally);
        assert!(record.downloaded_at.is_some());
    }

    #[tokio::test]
    async fn composite_key_separates_albums() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();
        tracker
            .record_download("IMG_1.JPG", "Home", "r2", 2048, "Home/IMG_1.JPG")
            .await
            .unwrap();

        let trip = tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        let home = tracker.get("IMG_1.JPG", "Home").await.unwrap().unwrap();
        assert_eq!(trip.remote_id, "r1");
        assert_eq!(home.remote_id, "r2");
    }

    #[tokio::test]
    async fn mark_deleted_preserves_fields() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();
        tracker.mark_deleted("IMG_1.JPG", "Trip").await.unwrap();

        let record = tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert!(record.deleted_locally);
        assert_eq!(record.remote_id, "r1");
        assert_eq!(record.size_bytes, 1024);
    }

    #[tokio::test]
    async fn record_download_clears_deleted_flag() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();
        tracker.mark_deleted("IMG_1.JPG", "Trip").await.unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();
        let record = tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert!(!record.deleted_locally);
    }

    #[tokio::test]
    async fn touch_seen_advances_timestamp_only() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();
        // Timestamps are whole seconds; rewind the stored value instead of
        // sleeping.
        let conn = tracker.lock().unwrap();
        conn.execute("UPDATE photos SET last_checked_at = last_checked_at - 10", [])
            .unwrap();
        drop(conn);
        let rewound = tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();

        tracker.touch_seen("IMG_1.JPG", "Trip").await.unwrap();
        let after = tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert!(after.last_checked_at > rewound.last_checked_at);
        assert_eq!(after.downloaded_at, rewound.downloaded_at);
        assert_eq!(after.remote_id, rewound.remote_id);
    }

    #[tokio::test]
    async fn photos_in_album_ordered_by_filename() {
        let tracker = Tracker::open_in_memory().unwrap();
        for name in ["c.jpg", "a.jpg", "b.jpg"] {
            tracker
                .record_download(name, "Trip", "r", 1, &format!("Trip/{}", name))
                .await
                .unwrap();
        }
        tracker
            .record_download("z.jpg", "Other", "r", 1, "Other/z.jpg")
            .await
            .unwrap();

        let records = tracker.photos_in_album("Trip").await.unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg", "c.jpg"]);
    }

    #[tokio::test]
    async fn stats_counts() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker
            .record_download("a.jpg", "Trip", "r1", 1, "Trip/a.jpg")
            .await
            .unwrap();
        tracker
            .record_download("b.jpg", "Trip", "r2", 1, "Trip/b.jpg")
            .await
            .unwrap();
        tracker.mark_deleted("b.jpg", "Trip").await.unwrap();

        let stats = tracker.stats().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.deleted_locally, 1);
        assert_eq!(stats.downloaded, 2);
    }

    #[tokio::test]
    async fn backup_and_corruption_recovery_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deletion_tracker.db");

        {
            let tracker = Tracker::open(&path).await.unwrap();
            tracker
                .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
                .await
                .unwrap();
            tracker.backup().await.unwrap();
            tracker.close();
        }

        // Truncate the live file to 10 bytes, then reopen.
        let contents = std::fs::read(&path).unwrap();
        std::fs::write(&path, &contents[..10]).unwrap();

        let tracker = Tracker::open(&path).await.unwrap();
        let record = tracker.get("IMG_1.JPG", "Trip").await.unwrap();
        assert!(record.is_some(), "records must survive recovery");
        assert_eq!(record.unwrap().remote_id, "r1");
    }

    #[tokio::test]
    async fn corruption_without_backup_yields_fresh_store() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deletion_tracker.db");
        std::fs::write(&path, b"this is not a database").unwrap();

        let tracker = Tracker::open(&path).await.unwrap();
        assert_eq!(tracker.stats().await.unwrap().total_records, 0);
    }

    #[tokio::test]
    async fn runtime_restore_from_backup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deletion_tracker.db");

        let tracker = Tracker::open(&path).await.unwrap();
        tracker
            .record_download("IMG_1.JPG", "Trip", "r1", 1024, "Trip/IMG_1.JPG")
            .await
            .unwrap();
        tracker.backup().await.unwrap();

        // New writes after the backup are expected to be lost on restore.
        tracker
            .record_download("IMG_2.JPG", "Trip", "r2", 99, "Trip/IMG_2.JPG")
            .await
            .unwrap();

        assert!(tracker.restore_from_backup().await.unwrap());
        assert!(tracker.get("IMG_1.JPG", "Trip").await.unwrap().is_some());
        assert!(tracker.get("IMG_2.JPG", "Trip").await.unwrap().is_none());
    }
}
