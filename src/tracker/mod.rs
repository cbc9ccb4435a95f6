//! Album-aware photo tracker: a durable SQLite store mapping
//! `(filename, album_name)` to download records, with integrity checks,
//! a rotating backup ring, and corruption recovery on open.

pub mod backup;
mod db;
mod error;
mod schema;
mod types;

pub use db::Tracker;
pub use error::TrackerError;
pub use types::{PhotoRecord, TrackerBackup, TrackerStats};
