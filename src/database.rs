//! Application-facing database handle.
//!
//! [`Database`] pairs a [`Bridge`] with an [`ImageStore`]: `open` restores
//! the stored image into the worker, `persist_database` exports it back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{Settings, SettingsError};
use crate::store::{ImageStore, SqliteImageStore, StoreError};
use crate::worker::protocol::{FlatRow, Params, ResultTable};
use crate::worker::{Bridge, BridgeError, ConsumerFailure};

/// File name written by [`Database::download_database`].
pub const DOWNLOAD_FILE: &str = "database.sqlite3";

/// Statement prepended to every [`Database::insert`].
const FOREIGN_KEYS_ON: &str = "PRAGMA foreign_keys = ON; ";

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("image store: {0}")]
    Store(#[from] StoreError),

    #[error("configuration: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A database running in a worker, persisted through an image store.
pub struct Database {
    bridge: Bridge,
    store: Arc<dyn ImageStore>,
    key: String,
}

impl Database {
    pub fn new(bridge: Bridge, store: Arc<dyn ImageStore>, key: impl Into<String>) -> Self {
        Self {
            bridge,
            store,
            key: key.into(),
        }
    }

    /// Spawn the worker and open the image store described by `settings`.
    ///
    /// The database itself is not opened yet; call [`Database::open`].
    pub async fn from_settings(settings: &Settings) -> DatabaseResult<Self> {
        let bridge = Bridge::spawn_with_settings(&settings.worker).await?;
        let store = SqliteImageStore::open(settings.storage.store_path()?)?;
        Ok(Self::new(bridge, Arc::new(store), settings.storage.key.clone()))
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Open the database from the stored image, or empty if none is stored.
    pub async fn open(&self) -> DatabaseResult<bool> {
        let image = self.store.get(&self.key).await?;
        tracing::debug!(
            key = %self.key,
            bytes = image.as_ref().map_or(0, Vec::len),
            "opening database"
        );
        Ok(self.bridge.open(image).await?)
    }

    pub async fn close(&self) -> DatabaseResult<()> {
        Ok(self.bridge.close().await?)
    }

    /// Execute SQL and return its result tables.
    pub async fn query(
        &self,
        sql: &str,
        params: Option<Params>,
    ) -> DatabaseResult<Vec<ResultTable>> {
        Ok(self.bridge.execute(sql, params).await?)
    }

    /// Execute SQL with foreign key enforcement switched on.
    pub async fn insert(
        &self,
        sql: &str,
        params: Option<Params>,
    ) -> DatabaseResult<Vec<ResultTable>> {
        let sql = format!("{}{}", FOREIGN_KEYS_ON, sql);
        Ok(self.bridge.execute(sql, params).await?)
    }

    /// Stream query rows into `on_row`. Returns the number of rows delivered.
    pub async fn each<F>(&self, sql: &str, params: Option<Params>, on_row: F) -> DatabaseResult<usize>
    where
        F: FnMut(FlatRow) -> Result<(), ConsumerFailure>,
    {
        Ok(self.bridge.each(sql, params, on_row).await?)
    }

    /// Export the current database image.
    pub async fn export_database(&self) -> DatabaseResult<Vec<u8>> {
        Ok(self.bridge.export_image().await?)
    }

    /// Export the image and save it to the store under this database's key.
    pub async fn persist_database(&self) -> DatabaseResult<()> {
        let image = self.export_database().await?;
        self.store.set(&self.key, &image).await?;
        tracing::info!(key = %self.key, bytes = image.len(), "database persisted");
        Ok(())
    }

    /// Export the image into `dir/database.sqlite3`. Returns the file path.
    pub async fn download_database<P: AsRef<Path>>(&self, dir: P) -> DatabaseResult<PathBuf> {
        let image = self.export_database().await?;
        let path = dir.as_ref().join(DOWNLOAD_FILE);

        tokio::fs::create_dir_all(dir.as_ref()).await?;
        tokio::fs::write(&path, &image).await?;

        tracing::info!(path = %path.display(), bytes = image.len(), "database downloaded");
        Ok(path)
    }
}
