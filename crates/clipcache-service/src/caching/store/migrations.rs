//! Versioned schema changes.
//!
//! The applied version lives in SQLite's `user_version` pragma. Every step also checks the
//! actual table layout before altering it, so databases written by older releases that never
//! recorded a version are upgraded in place without losing rows.

use rusqlite::{Connection, params};

use super::StoreError;

/// Timestamps below this value are seconds, not milliseconds (it is the year 5138 in seconds).
const MILLISECOND_THRESHOLD: i64 = 100_000_000_000;

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_audio_cache",
        apply: create_audio_cache,
    },
    Migration {
        version: 2,
        name: "add_compression",
        apply: add_compression,
    },
    Migration {
        version: 3,
        name: "add_last_accessed",
        apply: add_last_accessed,
    },
    Migration {
        version: 4,
        name: "millisecond_timestamps",
        apply: millisecond_timestamps,
    },
];

/// The version a fully migrated database reports.
pub const SCHEMA_VERSION: u32 = 4;

/// Applies all pending migrations, each in its own transaction.
pub(super) fn run(conn: &mut Connection) -> Result<u32, StoreError> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let mut version = current;

    for migration in MIGRATIONS.iter().filter(move |m| m.version > current) {
        let tx = conn.transaction()?;
        (migration.apply)(&tx).map_err(|source| StoreError::Migration {
            name: migration.name,
            source,
        })?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;

        tracing::info!(
            version = migration.version,
            migration = migration.name,
            "Applied clip store migration"
        );
        version = migration.version;
    }

    Ok(version)
}

fn has_column(conn: &Connection, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('audio_cache') WHERE name = ?1",
        params![column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn create_audio_cache(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audio_cache (
            cache_key TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            language_code TEXT NOT NULL,
            audio_data BLOB NOT NULL,
            audio_size INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_language_code ON audio_cache(language_code);
        CREATE INDEX IF NOT EXISTS idx_created_at ON audio_cache(created_at);",
    )
}

fn add_compression(conn: &Connection) -> rusqlite::Result<()> {
    if !has_column(conn, "compression")? {
        conn.execute_batch("ALTER TABLE audio_cache ADD COLUMN compression TEXT NULL;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_compression ON audio_cache(compression);",
    )
}

fn add_last_accessed(conn: &Connection) -> rusqlite::Result<()> {
    if !has_column(conn, "last_accessed")? {
        conn.execute_batch("ALTER TABLE audio_cache ADD COLUMN last_accessed INTEGER NULL;")?;
    }
    conn.execute_batch(
        "UPDATE audio_cache SET last_accessed = created_at WHERE last_accessed IS NULL;
         CREATE INDEX IF NOT EXISTS idx_last_accessed ON audio_cache(last_accessed);",
    )
}

fn millisecond_timestamps(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE audio_cache SET created_at = created_at * 1000 WHERE created_at < ?1",
        params![MILLISECOND_THRESHOLD],
    )?;
    conn.execute(
        "UPDATE audio_cache SET last_accessed = last_accessed * 1000 WHERE last_accessed < ?1",
        params![MILLISECOND_THRESHOLD],
    )?;
    Ok(())
}
