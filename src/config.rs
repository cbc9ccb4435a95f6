//! Application configuration.
//!
//! Loaded from environment variables (optionally seeded from a `.env`
//! file by `main`), mirroring the external loader boundary: every
//! recognized option is a field here, and nothing else is accepted.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::filter::AlbumRules;
use crate::notify::PushoverConfig;
use crate::types::{ExecutionMode, LogLevel};

/// Tracker file name under the database parent directory.
pub const TRACKER_FILE_NAME: &str = "deletion_tracker.db";
/// Lock file name under the database parent directory.
pub const LOCK_FILE_NAME: &str = "iphoto_downloader.lock";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// The full static configuration record.
pub struct Config {
    // Heap types first
    pub sync_directory: PathBuf,
    pub database_parent_directory: String,
    pub icloud_username: String,
    pub personal_album_names_to_include: Vec<String>,
    pub shared_album_names_to_include: Vec<String>,
    pub pushover_api_token: Option<String>,
    pub pushover_user_key: Option<String>,
    pub pushover_device: Option<String>,

    // Durations
    pub sync_interval: Duration,
    pub maintenance_interval: Duration,

    // Integers
    pub max_downloads: u32,
    pub max_file_size_mb: u64,
    pub auth_web_port_range: (u16, u16),

    // 1-byte enums
    pub log_level: LogLevel,
    pub execution_mode: ExecutionMode,

    // Booleans grouped at the end
    pub dry_run: bool,
    pub allow_multi_instance: bool,
    pub include_personal_albums: bool,
    pub include_shared_albums: bool,
    pub enable_pushover: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("sync_directory", &self.sync_directory)
            .field("database_parent_directory", &self.database_parent_directory)
            .field("icloud_username", &self.icloud_username)
            .field("execution_mode", &self.execution_mode)
            .field("dry_run", &self.dry_run)
            .field("include_personal_albums", &self.include_personal_albums)
            .field("include_shared_albums", &self.include_shared_albums)
            .field("enable_pushover", &self.enable_pushover)
            .field("pushover_api_token", &"<redacted>")
            .field("pushover_user_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_name_set(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_port_range(value: &str) -> Result<(u16, u16), String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| "expected START-END".to_string())?;
    let start: u16 = start.trim().parse().map_err(|_| "invalid start port")?;
    let end: u16 = end.trim().parse().map_err(|_| "invalid end port")?;
    if start > end {
        return Err(format!("start {} above end {}", start, end));
    }
    Ok((start, end))
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup (the test seam).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let sync_directory = get("SYNC_DIRECTORY")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("SYNC_DIRECTORY"))?;
        let icloud_username =
            get("ICLOUD_USERNAME").ok_or(ConfigError::Missing("ICLOUD_USERNAME"))?;

        let log_level = match get("LOG_LEVEL") {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                key: "LOG_LEVEL",
                reason,
            })?,
            None => LogLevel::Info,
        };
        let execution_mode = match get("EXECUTION_MODE") {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                key: "EXECUTION_MODE",
                reason,
            })?,
            None => ExecutionMode::Single,
        };

        let max_downloads = match get("MAX_DOWNLOADS") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "MAX_DOWNLOADS",
                reason: format!("not an integer: {}", v),
            })?,
            None => 0,
        };
        let max_file_size_mb = match get("MAX_FILE_SIZE_MB") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "MAX_FILE_SIZE_MB",
                reason: format!("not an integer: {}", v),
            })?,
            None => 0,
        };

        let sync_interval_minutes: f64 = match get("SYNC_INTERVAL_MINUTES") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "SYNC_INTERVAL_MINUTES",
                reason: format!("not a number: {}", v),
            })?,
            None => 2.0,
        };
        let maintenance_interval_hours: f64 = match get("MAINTENANCE_INTERVAL_HOURS") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "MAINTENANCE_INTERVAL_HOURS",
                reason: format!("not a number: {}", v),
            })?,
            None => 1.0,
        };
        // Duration construction panics on negative or NaN input, so these
        // have to be rejected before the conversion, not in validate().
        if !(sync_interval_minutes > 0.0) {
            return Err(ConfigError::Invalid {
                key: "SYNC_INTERVAL_MINUTES",
                reason: "must be positive".into(),
            });
        }
        if !(maintenance_interval_hours > 0.0) {
            return Err(ConfigError::Invalid {
                key: "MAINTENANCE_INTERVAL_HOURS",
                reason: "must be positive".into(),
            });
        }

        let auth_web_port_range = match get("AUTH_WEB_PORT_RANGE") {
            Some(v) => parse_port_range(&v).map_err(|reason| ConfigError::Invalid {
                key: "AUTH_WEB_PORT_RANGE",
                reason,
            })?,
            None => crate::auth2fa::DEFAULT_PORT_RANGE,
        };

        let config = Self {
            sync_directory,
            database_parent_directory: get("DATABASE_PARENT_DIRECTORY")
                .unwrap_or_else(|| ".data".to_string()),
            icloud_username,
            personal_album_names_to_include: get("PERSONAL_ALBUM_NAMES_TO_INCLUDE")
                .map(|v| parse_name_set(&v))
                .unwrap_or_default(),
            shared_album_names_to_include: get("SHARED_ALBUM_NAMES_TO_INCLUDE")
                .map(|v| parse_name_set(&v))
                .unwrap_or_default(),
            pushover_api_token: get("PUSHOVER_API_TOKEN"),
            pushover_user_key: get("PUSHOVER_USER_KEY"),
            pushover_device: get("PUSHOVER_DEVICE"),
            sync_interval: Duration::from_secs_f64(sync_interval_minutes * 60.0),
            maintenance_interval: Duration::from_secs_f64(maintenance_interval_hours * 3600.0),
            max_downloads,
            max_file_size_mb,
            auth_web_port_range,
            log_level,
            execution_mode,
            dry_run: get("DRY_RUN").map(|v| parse_bool(&v)).unwrap_or(false),
            allow_multi_instance: get("ALLOW_MULTI_INSTANCE")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            include_personal_albums: get("INCLUDE_PERSONAL_ALBUMS")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            include_shared_albums: get("INCLUDE_SHARED_ALBUMS")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            enable_pushover: get("ENABLE_PUSHOVER").map(|v| parse_bool(&v)).unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.include_personal_albums && !self.include_shared_albums {
            return Err(ConfigError::Invalid {
                key: "INCLUDE_PERSONAL_ALBUMS",
                reason: "at least one of personal or shared albums must be included".into(),
            });
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SYNC_INTERVAL_MINUTES",
                reason: "must be positive".into(),
            });
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "MAINTENANCE_INTERVAL_HOURS",
                reason: "must be positive".into(),
            });
        }
        if self.maintenance_interval <= self.sync_interval {
            return Err(ConfigError::Invalid {
                key: "MAINTENANCE_INTERVAL_HOURS",
                reason: "maintenance interval must be longer than the sync interval".into(),
            });
        }
        if self.enable_pushover
            && (self.pushover_api_token.is_none() || self.pushover_user_key.is_none())
        {
            return Err(ConfigError::Invalid {
                key: "ENABLE_PUSHOVER",
                reason: "PUSHOVER_API_TOKEN and PUSHOVER_USER_KEY are required".into(),
            });
        }
        Ok(())
    }

    /// Resolve the database parent directory.
    ///
    /// `%LOCALAPPDATA%` expands to the user-local application-data
    /// directory (on non-Windows hosts, `$XDG_DATA_HOME` or
    /// `$HOME/.local/share`). Relative paths resolve against the sync
    /// root; absolute paths are used verbatim.
    pub fn database_dir(&self) -> PathBuf {
        let raw = &self.database_parent_directory;
        let expanded = if raw.contains("%LOCALAPPDATA%") {
            let local = local_app_data_dir();
            raw.replace("%LOCALAPPDATA%", &local.to_string_lossy())
        } else {
            raw.clone()
        };
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            path
        } else {
            self.sync_directory.join(path)
        }
    }

    pub fn tracker_db_path(&self) -> PathBuf {
        self.database_dir().join(TRACKER_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.database_dir().join(LOCK_FILE_NAME)
    }

    /// Album selection rules for the filter, with duplicates dropped.
    pub fn album_rules(&self) -> AlbumRules {
        let dedupe = |names: &[String]| {
            let mut seen = HashSet::new();
            names
                .iter()
                .filter(|n| seen.insert(n.as_str().to_string()))
                .cloned()
                .collect()
        };
        AlbumRules {
            include_personal: self.include_personal_albums,
            include_shared: self.include_shared_albums,
            personal_allowlist: dedupe(&self.personal_album_names_to_include),
            shared_allowlist: dedupe(&self.shared_album_names_to_include),
        }
    }

    pub fn pushover_config(&self) -> Option<PushoverConfig> {
        if !self.enable_pushover {
            return None;
        }
        Some(PushoverConfig {
            api_token: self.pushover_api_token.clone()?,
            user_key: self.pushover_user_key.clone()?,
            device: self.pushover_device.clone(),
        })
    }
}

fn local_app_data_dir() -> PathBuf {
    if cfg!(windows) {
        if let Some(dir) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        let path = PathBuf::from(dir);
        if path.is_absolute() {
            return path;
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".local").join("share"))
        .unwrap_or_else(|| PathBuf::from("."))
}
