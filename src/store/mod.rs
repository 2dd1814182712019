//! Persistent storage for database images.
//!
//! The bridge itself never touches disk: the database lives inside the
//! worker. To survive restarts, the facade exports the image and hands the
//! bytes to an [`ImageStore`] under a key, then loads them back on the next
//! open.
//!
//! # Design
//!
//! - Simple key-value store with BLOB values
//! - Versioned - auto-clears on version mismatch
//! - [`MemoryImageStore`] for tests and throwaway sessions

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

/// Current store schema version. Bump this when the table layout changes.
const STORE_VERSION: i32 = 1;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Async key-value storage for database images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Load the image stored under `key`, if any.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Store `image` under `key`, replacing any previous value.
    async fn set(&self, key: &str, image: &[u8]) -> StoreResult<()>;
}

/// SQLite-backed image store.
pub struct SqliteImageStore {
    conn: Mutex<Connection>,
}

impl SqliteImageStore {
    /// Open or create the store database at `path`.
    ///
    /// If the store version doesn't match, it's automatically cleared.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init()?;

        tracing::debug!(path = %path.display(), "image store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Initialize the store schema and check version.
    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS images (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        if stored_version != Some(STORE_VERSION) {
            if stored_version.is_some() {
                tracing::info!(?stored_version, "image store version changed, clearing");
                conn.execute("DELETE FROM images", [])?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
                params![STORE_VERSION.to_string()],
            )?;
        }

        Ok(())
    }

    /// Delete an image. Returns true if one was stored.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM images WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    /// List stored keys.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM images ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[async_trait]
impl ImageStore for SqliteImageStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let image = self
            .conn()?
            .query_row(
                "SELECT value FROM images WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(image)
    }

    async fn set(&self, key: &str, image: &[u8]) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO images (key, value) VALUES (?, ?)",
            params![key, image],
        )?;
        tracing::debug!(key, bytes = image.len(), "image stored");
        Ok(())
    }
}

/// In-memory image store.
#[derive(Default)]
pub struct MemoryImageStore {
    images: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let images = self.images.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(images.get(key).cloned())
    }

    async fn set(&self, key: &str, image: &[u8]) -> StoreResult<()> {
        let mut images = self.images.lock().map_err(|_| StoreError::Poisoned)?;
        images.insert(key.to_string(), image.to_vec());
        Ok(())
    }
}
