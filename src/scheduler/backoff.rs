//! Persistent back-off for incomplete 2FA.
//!
//! Each consecutive 2FA failure doubles the wait before the next attempt,
//! starting at 8 minutes and capping at 2 days. The state lives in a JSON
//! file in the OS temp directory so a process restart does not reset the
//! count.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File name under the OS temp directory.
pub const BACKOFF_FILE_NAME: &str = "iphoto_downloader_backoff.json";

const INITIAL_DELAY_SECS: u64 = 8 * 60;
const MAX_DELAY_SECS: u64 = 2 * 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBackoff {
    backoff_seconds: u64,
    consecutive_failures: u32,
}

/// Exponential 2FA back-off with temp-file persistence.
#[derive(Debug)]
pub struct TwoFactorBackoff {
    file: PathBuf,
    delay_secs: u64,
    failures: u32,
}

impl TwoFactorBackoff {
    /// Load from the default temp-dir location.
    pub fn load_default() -> Self {
        Self::load(std::env::temp_dir().join(BACKOFF_FILE_NAME))
    }

    /// Load persisted state; missing or corrupt files mean no back-off.
    pub fn load(file: PathBuf) -> Self {
        let (delay_secs, failures) = match std::fs::read_to_string(&file) {
            Ok(contents) => match serde_json::from_str::<PersistedBackoff>(&contents) {
                Ok(state) => (
                    state.backoff_seconds.min(MAX_DELAY_SECS),
                    state.consecutive_failures,
                ),
                Err(e) => {
                    tracing::warn!("Corrupt back-off file {}: {}", file.display(), e);
                    (0, 0)
                }
            },
            Err(_) => (0, 0),
        };
        Self {
            file,
            delay_secs,
            failures,
        }
    }

    /// The wait to apply before the next attempt; `None` when no 2FA
    /// failure is outstanding.
    pub fn current_delay(&self) -> Option<Duration> {
        if self.delay_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.delay_secs))
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// One more 2FA failure: double the delay (first failure starts at 8
    /// minutes), cap at 2 days, persist.
    pub fn record_failure(&mut self) -> Duration {
        self.failures += 1;
        let previous = self.delay_secs;
        self.delay_secs = if self.delay_secs == 0 {
            INITIAL_DELAY_SECS
        } else {
            (self.delay_secs * 2).min(MAX_DELAY_SECS)
        };
        self.persist();
        tracing::info!(
            "2FA back-off: {} -> {} seconds ({} consecutive failures)",
            previous,
            self.delay_secs,
            self.failures
        );
        Duration::from_secs(self.delay_secs)
    }

    /// Authentication succeeded: clear state and delete the file.
    pub fn reset(&mut self) {
        if self.delay_secs != 0 {
            tracing::info!("Resetting 2FA back-off after successful authentication");
        }
        self.delay_secs = 0;
        self.failures = 0;
        if self.file.exists() {
            if let Err(e) = std::fs::remove_file(&self.file) {
                tracing::warn!("Could not delete back-off file: {}", e);
            }
        }
    }

    fn persist(&self) {
        let state = PersistedBackoff {
            backoff_seconds: self.delay_secs,
            consecutive_failures: self.failures,
        };
        match serde_json::to_string(&state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file, json) {
                    tracing::warn!("Could not persist back-off state: {}", e);
                }
            }
            Err(e) => tracing::warn!("Could not serialize back-off state: {}", e),
        }
    }
}
