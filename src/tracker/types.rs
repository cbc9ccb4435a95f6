//! Types for the photo tracker.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// A tracked photo, keyed by `(filename, album_name)`.
///
/// Both key components are case-sensitive. `local_relpath` is the path of
/// the downloaded file relative to the sync root, always
/// `<album_name>/<filename>` with normalized separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRecord {
    /// Photo filename after normalization.
    pub filename: String,
    /// Name of the album the photo was downloaded from.
    pub album_name: String,
    /// Opaque identifier assigned by the cloud service.
    pub remote_id: String,
    /// File size in bytes as reported by the cloud; 0 when unknown.
    pub size_bytes: u64,
    /// Path relative to the sync root.
    pub local_relpath: String,
    /// When the file was downloaded, if it ever was.
    pub downloaded_at: Option<DateTime<Utc>>,
    /// When a sync cycle last saw this key in the remote listing.
    pub last_checked_at: DateTime<Utc>,
    /// True once the user has removed the local file; the photo is never
    /// downloaded again for this key.
    pub deleted_locally: bool,
}

/// Counters reported by [`Tracker::stats`](super::Tracker::stats) for the
/// cycle summary.
#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    /// Total records in the store.
    pub total_records: u64,
    /// Records flagged as deleted locally.
    pub deleted_locally: u64,
    /// Records with a completed download.
    pub downloaded: u64,
}

/// Metadata for one completed backup of the tracker file.
#[derive(Debug, Clone)]
pub struct TrackerBackup {
    /// Path of the backup file.
    pub path: PathBuf,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the backup file contents.
    pub source_hash: String,
}
