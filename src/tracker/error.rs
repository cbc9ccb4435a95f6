//! Error types for the photo tracker.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during tracker operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// The tracker store could not be opened or (re)created. Fatal.
    #[error("Tracker unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// A write could not be committed. Fatal for the current cycle.
    #[error("Tracker write failed: {0}")]
    WriteFailed(String),

    /// A read query failed for a reason other than a key miss.
    #[error("Tracker query failed: {0}")]
    Query(String),

    /// Failed to run a schema migration.
    #[error("Tracker migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// Backup or restore I/O failed.
    #[error("Tracker backup failed at {path}: {source}")]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The stored schema version is newer than this build understands.
    #[error("Tracker schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

impl TrackerError {
    /// Wrap a rusqlite error from a read path.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    /// Wrap a rusqlite error from a write path.
    pub fn write(source: rusqlite::Error) -> Self {
        Self::WriteFailed(source.to_string())
    }
}
