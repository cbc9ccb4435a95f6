//! Tracker schema definitions and migrations.

use rusqlite::Connection;

use super::error::TrackerError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Schema DDL for version 2: album-aware composite key.
const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS photos (
    filename TEXT NOT NULL,
    album_name TEXT NOT NULL,
    remote_id TEXT NOT NULL DEFAULT '',
    size_bytes INTEGER NOT NULL DEFAULT 0,
    local_relpath TEXT NOT NULL DEFAULT '',
    downloaded_at INTEGER,
    last_checked_at INTEGER NOT NULL DEFAULT 0,
    deleted_locally INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (filename, album_name)
);

CREATE INDEX IF NOT EXISTS idx_photos_album ON photos(album_name);
CREATE INDEX IF NOT EXISTS idx_photos_deleted ON photos(deleted_locally);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, TrackerError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), TrackerError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// Idempotent and safe to call on both new and existing databases. Each
/// forward migration runs inside a single transaction.
pub(crate) fn migrate(conn: &Connection) -> Result<(), TrackerError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(TrackerError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        // Fresh database
        conn.execute_batch(SCHEMA_V2)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized tracker schema at version {}", SCHEMA_VERSION);
    } else if current_version < SCHEMA_VERSION {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

/// Apply the migration for a specific version.
fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), TrackerError> {
    match version {
        2 => migrate_v1_to_v2(conn)?,
        other => {
            tracing::warn!("No migration defined for schema version {}", other);
            conn.execute_batch(SCHEMA_V2)?;
        }
    }
    set_schema_version(conn, version)?;
    tracing::info!("Migrated tracker to schema version {}", version);
    Ok(())
}

/// v1 keyed photos by filename alone. v2 introduces the composite
/// `(filename, album_name)` key; legacy rows land in album "Unknown",
/// matching where pre-album syncs placed their files.
fn migrate_v1_to_v2(conn: &Connection) -> Result<(), TrackerError> {
    let tx_result: Result<(), rusqlite::Error> = (|| {
        conn.execute_batch("BEGIN")?;
        conn.execute_batch("ALTER TABLE photos RENAME TO photos_v1")?;
        conn.execute_batch(SCHEMA_V2)?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO photos
                (filename, album_name, remote_id, size_bytes, local_relpath,
                 downloaded_at, last_checked_at, deleted_locally)
            SELECT filename, 'Unknown', remote_id, size_bytes, local_relpath,
                   downloaded_at, last_checked_at, deleted_locally
            FROM photos_v1
            "#,
            [],
        )?;
        conn.execute_batch("DROP TABLE photos_v1")?;
        conn.execute_batch("COMMIT")?;
        Ok(())
    })();

    if let Err(e) = tx_result {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(TrackerError::Migration(e));
    }
    Ok(())
}
