//! Single-instance enforcement via an advisory file lock.
//!
//! The lock is a real OS lock (`flock` or the platform equivalent), so it
//! dies with the process: a lock file left behind by a crash is reclaimed
//! simply by locking it again. The holder's PID is written into the file
//! purely so the losing process can name who beat it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("another instance is already running{}", pid_suffix(.pid))]
    AlreadyLocked { pid: Option<u32> },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn pid_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (PID {})", pid),
        None => String::new(),
    }
}

/// Held for the duration of a sync cycle; released on drop, including
/// unwinds.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the exclusive lock at `path`.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        if file.try_lock_exclusive().is_err() {
            let mut contents = String::new();
            let _ = file.read_to_string(&mut contents);
            let pid = contents.trim().parse::<u32>().ok();
            return Err(LockError::AlreadyLocked { pid });
        }

        file.set_len(0).map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        write!(file, "{}", std::process::id()).map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let _ = file.flush();

        tracing::info!("Acquired instance lock: {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        // Best effort; a leftover unlocked file is harmless.
        let _ = std::fs::remove_file(&self.path);
        tracing::debug!("Released instance lock: {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_pid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("iphoto_downloader.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn second_acquire_fails_with_pid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("iphoto_downloader.lock");
        let _held = InstanceLock::acquire(&path).unwrap();

        match InstanceLock::acquire(&path) {
            Err(LockError::AlreadyLocked { pid }) => {
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn reacquire_after_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("iphoto_downloader.lock");
        drop(InstanceLock::acquire(&path).unwrap());
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn stale_unlock_file_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("iphoto_downloader.lock");
        // Simulates a crash: file exists, but no process holds the lock.
        std::fs::write(&path, "999999").unwrap();
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
