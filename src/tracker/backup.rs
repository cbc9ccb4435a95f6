//! Backup, rotation, and recovery for the tracker file.
//!
//! All functions here operate on paths with blocking I/O; callers wrap
//! them in `spawn_blocking`. Backups live in a `backups/` directory next
//! to the live file, named by UTC timestamp so lexicographic order is
//! chronological order.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use super::error::TrackerError;
use super::types::TrackerBackup;

/// How many backups to keep before rotating the oldest out.
pub const BACKUP_RETENTION: usize = 5;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Directory holding backups for the given tracker file.
pub fn backup_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("backups")
}

fn db_file_name(db_path: &Path) -> String {
    db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "deletion_tracker.db".to_string())
}

/// Run `PRAGMA integrity_check` against the file at `path`.
///
/// Returns false for missing files, unopenable files, and structural
/// corruption. Never returns an error: a file that cannot be checked is a
/// file that cannot be trusted.
pub fn integrity_ok(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Cannot open {} for integrity check: {}", path.display(), e);
            return false;
        }
    };
    match conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0)) {
        Ok(result) if result == "ok" => true,
        Ok(result) => {
            tracing::error!("Integrity check failed for {}: {}", path.display(), result);
            false
        }
        Err(e) => {
            tracing::error!("Integrity check errored for {}: {}", path.display(), e);
            false
        }
    }
}

/// Copy the live tracker file into the backup directory and rotate.
pub fn create_backup(db_path: &Path, retention: usize) -> Result<TrackerBackup, TrackerError> {
    let created_at = Utc::now();
    let dir = backup_dir(db_path);
    fs::create_dir_all(&dir).map_err(|e| TrackerError::Backup {
        path: dir.clone(),
        source: e,
    })?;

    let name = format!(
        "{}-{}",
        created_at.format(TIMESTAMP_FORMAT),
        db_file_name(db_path)
    );
    let backup_path = dir.join(name);

    fs::copy(db_path, &backup_path).map_err(|e| TrackerError::Backup {
        path: backup_path.clone(),
        source: e,
    })?;

    let source_hash = hash_file(&backup_path).map_err(|e| TrackerError::Backup {
        path: backup_path.clone(),
        source: e,
    })?;

    rotate_backups(db_path, retention);

    tracing::info!("Tracker backup created: {}", backup_path.display());
    Ok(TrackerBackup {
        path: backup_path,
        created_at,
        source_hash,
    })
}

/// All existing backups for `db_path`, newest first.
pub fn list_backups(db_path: &Path) -> Vec<PathBuf> {
    let dir = backup_dir(db_path);
    let suffix = format!("-{}", db_file_name(db_path));
    let mut backups: Vec<PathBuf> = match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    // Timestamp prefix makes name order chronological; newest first.
    backups.sort();
    backups.reverse();
    backups
}

/// Delete backups beyond the retention count.
fn rotate_backups(db_path: &Path, retention: usize) {
    for old in list_backups(db_path).into_iter().skip(retention) {
        match fs::remove_file(&old) {
            Ok(()) => tracing::info!("Removed old backup: {}", old.display()),
            Err(e) => tracing::warn!("Failed to remove old backup {}: {}", old.display(), e),
        }
    }
}

/// Replace the live file with the newest backup that passes its own
/// integrity check. The corrupt live file, if any, is sidelined rather
/// than deleted so it stays available for forensics.
///
/// Returns the path of the backup that was restored, or `None` when no
/// usable backup exists.
pub fn restore_newest_valid(db_path: &Path) -> Result<Option<PathBuf>, TrackerError> {
    let candidates = list_backups(db_path);
    if candidates.is_empty() {
        tracing::error!("No backups found for recovery of {}", db_path.display());
        return Ok(None);
    }

    let valid = match candidates.iter().find(|b| integrity_ok(b)) {
        Some(b) => b.clone(),
        None => {
            tracing::error!("All backups for {} fail integrity checks", db_path.display());
            return Ok(None);
        }
    };

    if db_path.exists() {
        sideline_corrupt(db_path);
    }

    fs::copy(&valid, db_path).map_err(|e| TrackerError::Backup {
        path: valid.clone(),
        source: e,
    })?;
    tracing::info!("Tracker recovered from backup: {}", valid.display());
    Ok(Some(valid))
}

/// Move a corrupt live file aside as `corrupted-<timestamp>-<name>`.
pub fn sideline_corrupt(db_path: &Path) {
    let stamp: DateTime<Utc> = Utc::now();
    let name = format!(
        "corrupted-{}-{}",
        stamp.format(TIMESTAMP_FORMAT),
        db_file_name(db_path)
    );
    let target = db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(name);
    match fs::rename(db_path, &target) {
        Ok(()) => tracing::info!("Moved corrupt tracker to {}", target.display()),
        Err(e) => {
            tracing::warn!("Could not sideline corrupt tracker: {}; deleting", e);
            let _ = fs::remove_file(db_path);
        }
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}
