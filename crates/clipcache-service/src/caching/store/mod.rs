//! Durable storage of clips in a single SQLite table.
//!
//! The [`Store`] is a thin, synchronous layer over one connection. Async code reaches it through
//! [`Store::run`], which moves the work onto tokio's blocking pool.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use super::cache_key::CacheKey;
use super::compression::{CodecError, Compression};

mod migrations;

pub use migrations::SCHEMA_VERSION;

/// An error talking to the clip store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create store directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open store at {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("schema migration `{name}` failed")]
    Migration {
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("store query failed")]
    Query(#[from] rusqlite::Error),
    /// A row that cannot be interpreted, for example because of an unknown compression marker.
    #[error("stored clip is unreadable")]
    Codec(#[from] CodecError),
    #[error("store worker failed")]
    Worker(#[from] tokio::task::JoinError),
}

/// One stored clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipEntry {
    /// Hex digest of the [`CacheKey`].
    pub key: String,
    /// The text as it was originally requested, before normalization.
    pub text: String,
    pub language_code: String,
    /// The stored bytes, encoded according to `compression`.
    pub payload: Bytes,
    pub compression: Compression,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl ClipEntry {
    /// Creates a fresh entry whose last access is its creation.
    pub fn new(
        key: &CacheKey,
        text: impl Into<String>,
        language_code: impl Into<String>,
        payload: Bytes,
        compression: Compression,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.to_hex(),
            text: text.into(),
            language_code: language_code.into(),
            payload,
            compression,
            created_at,
            last_accessed_at: created_at,
        }
    }

    /// Size of the payload as stored, which is what counts against the size budget.
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Aggregates over the whole table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub clips: u64,
    pub bytes: u64,
    pub compressed_clips: u64,
}

/// Count and size of the clips of one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageUsage {
    pub language_code: String,
    pub clips: u64,
    pub bytes: u64,
}

/// The durable key to clip table.
///
/// Cloning is cheap, all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<Arc<Path>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Opens (or creates) the store at `path` and brings its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_owned(),
                source,
            })?;
        }

        let open_err = |source| StoreError::Open {
            path: path.to_owned(),
            source,
        };
        let mut conn = Connection::open(path).map_err(open_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(open_err)?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(open_err)?;
        tracing::debug!(path = %path.display(), journal_mode, "Opened clip store");

        migrations::run(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.into()),
        })
    }

    /// Creates a private in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        migrations::run(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// The file backing this store, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Runs `f` on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// The schema version the database is at.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Point lookup. Absence is `Ok(None)`, never an error.
    pub fn get(&self, key: &str) -> Result<Option<ClipEntry>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT cache_key, text, language_code, audio_data, compression, created_at, last_accessed
                 FROM audio_cache WHERE cache_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((key, text, language_code, payload, marker, created_at, last_accessed)) = row
        else {
            return Ok(None);
        };

        let compression = Compression::from_marker(marker.as_deref())?;
        let created_at = from_millis(created_at);
        let last_accessed_at = last_accessed.map_or(created_at, from_millis);

        Ok(Some(ClipEntry {
            key,
            text,
            language_code,
            payload: payload.into(),
            compression,
            created_at,
            last_accessed_at,
        }))
    }

    /// Inserts `entry`, fully replacing any entry with the same key.
    ///
    /// The recorded size is always the length of the payload being written.
    pub fn put(&self, entry: &ClipEntry) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO audio_cache
             (cache_key, text, language_code, audio_data, audio_size, compression, created_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.key,
                entry.text,
                entry.language_code,
                &entry.payload[..],
                entry.size_bytes() as i64,
                entry.compression.marker(),
                entry.created_at.timestamp_millis(),
                entry
                    .last_accessed_at
                    .max(entry.created_at)
                    .timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Deletes the entry for `key`, returning whether one existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM audio_cache WHERE cache_key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// Deletes all given keys in one transaction, returning how many entries existed.
    pub fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM audio_cache WHERE cache_key = ?1")?;
            for key in keys {
                deleted += stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// The summed size of all stored payloads.
    pub fn total_size(&self) -> Result<u64, StoreError> {
        let size: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(audio_size), 0) FROM audio_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(size as u64)
    }

    /// All keys with their sizes, least recently accessed first.
    pub fn scan_by_last_access(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT cache_key, audio_size FROM audio_cache
             ORDER BY last_accessed ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Records an access to `key`.
    ///
    /// The stored time never moves before the entry's creation. Returns whether the entry
    /// still exists.
    pub fn touch_last_accessed(
        &self,
        key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            "UPDATE audio_cache SET last_accessed = MAX(?1, created_at) WHERE cache_key = ?2",
            params![timestamp.timestamp_millis(), key],
        )?;
        Ok(updated > 0)
    }

    /// Swaps in a re-encoded payload, but only while the entry is still uncompressed.
    ///
    /// An entry that was rewritten in the meantime (for example by a forced refresh that
    /// stored a compressed payload) is left alone. Returns whether the payload was replaced.
    pub fn replace_payload_if_uncompressed(
        &self,
        key: &str,
        payload: &[u8],
        compression: Compression,
    ) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            "UPDATE audio_cache SET audio_data = ?1, audio_size = ?2, compression = ?3
             WHERE cache_key = ?4 AND (compression IS NULL OR compression = 'none')",
            params![payload, payload.len() as i64, compression.marker(), key],
        )?;
        Ok(updated > 0)
    }

    /// Number of clips, their total size, and how many of them are compressed.
    pub fn summary(&self) -> Result<StoreSummary, StoreError> {
        let (clips, bytes, compressed_clips): (i64, i64, i64) = self.conn().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(audio_size), 0),
                    COALESCE(SUM(compression IS NOT NULL AND compression != 'none'), 0)
             FROM audio_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StoreSummary {
            clips: clips as u64,
            bytes: bytes as u64,
            compressed_clips: compressed_clips as u64,
        })
    }

    /// Per-language clip counts and sizes, ordered by language code.
    pub fn language_breakdown(&self) -> Result<Vec<LanguageUsage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT language_code, COUNT(*), COALESCE(SUM(audio_size), 0)
             FROM audio_cache GROUP BY language_code ORDER BY language_code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LanguageUsage {
                language_code: row.get(0)?,
                clips: row.get::<_, i64>(1)? as u64,
                bytes: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
