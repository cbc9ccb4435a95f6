//! Persisted trusted-session blob.
//!
//! The session is an opaque string map (tokens captured from response
//! headers) written as JSON to a per-user directory with owner-only
//! permissions. Loading it before any prompt is what lets a trusted
//! session skip the 2FA dance on subsequent runs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Keep only word characters so the username is filesystem-safe.
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Default per-user session directory:
/// `<user_state_dir>/iphoto_downloader/sessions`.
pub fn default_session_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("iphoto_downloader")
        .join("sessions")
}

/// On-disk session data for one account.
pub struct SessionStore {
    path: PathBuf,
    data: HashMap<String, String>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("keys", &self.data.len())
            .finish()
    }
}

impl SessionStore {
    /// Load the session for `username` from `dir`, creating the directory
    /// (owner-only) if needed. A missing or corrupt file yields an empty
    /// session.
    pub fn load(dir: &Path, username: &str) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }

        let path = dir.join(format!("{}.session", sanitize_username(username)));
        let data = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<HashMap<String, String>>(&contents) {
                    Ok(map) => {
                        tracing::debug!("Loaded session data from {}", path.display());
                        map
                    }
                    Err(_) => {
                        tracing::info!("Session file corrupt, starting fresh");
                        HashMap::new()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read session file {}: {}", path.display(), e);
                    HashMap::new()
                }
            }
        } else {
            tracing::debug!("No session file at {}", path.display());
            HashMap::new()
        };

        Ok(Self { path, data })
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Persist the map with mode 0600.
    pub fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        tracing::debug!("Saved session data to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_strips_symbols() {
        assert_eq!(sanitize_username("user@example.com"), "userexamplecom");
        assert_eq!(sanitize_username("ab_c123"), "ab_c123");
    }

    #[test]
    fn save_and_reload_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut store = SessionStore::load(tmp.path(), "user@example.com").unwrap();
        store.set("session_token", "tok123");
        store.set("trust_token", "trust456");
        store.save().unwrap();

        let reloaded = SessionStore::load(tmp.path(), "user@example.com").unwrap();
        assert_eq!(reloaded.get("session_token").map(String::as_str), Some("tok123"));
        assert_eq!(reloaded.get("trust_token").map(String::as_str), Some("trust456"));
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("user.session");
        fs::write(&path, b"{not json").unwrap();
        let store = SessionStore::load(tmp.path(), "user").unwrap();
        assert!(!store.contains("session_token"));
    }

    #[cfg(unix)]
    #[test]
    fn session_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let mut store = SessionStore::load(tmp.path(), "user").unwrap();
        store.set("session_token", "tok");
        store.save().unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
