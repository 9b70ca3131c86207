// Embedded key-value metadata backend
//
// SQLite-backed persistent metadata storage for production use. Raw key
// bytes go in as the primary key; values are opaque blobs.

use crate::error::{Result, StorageNodeError};
use crate::metadata::MetadataBackend;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Metadata backend on top of an embedded SQLite database
pub struct EmbeddedKvBackend {
    /// Database connection
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddedKvBackend {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        info!(
            "opening embedded metadata database at {:?}",
            db_path.as_ref()
        );

        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageNodeError::Backend(format!("creating database directory: {e}"))
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StorageNodeError::Backend(format!("opening database: {e}")))?;
        Self::initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageNodeError::Backend(format!("opening database: {e}")))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<()> {
        debug!("initializing metadata schema");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS object_metadata (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageNodeError::Backend(format!("creating metadata table: {e}")))?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageNodeError::Backend(format!("acquiring database lock: {e}")))
    }
}

#[async_trait]
impl MetadataBackend for EmbeddedKvBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO object_metadata (key, value) VALUES (?, ?)",
            params![key, value],
        )
        .map_err(|e| StorageNodeError::Backend(format!("inserting metadata: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let conn = self.lock_conn()?;
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM object_metadata WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageNodeError::Backend(format!("querying metadata: {e}")))?;
        value.ok_or_else(|| StorageNodeError::NotFound(format!("metadata key {key}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM object_metadata WHERE key = ?", params![key])
            .map_err(|e| StorageNodeError::Backend(format!("deleting metadata: {e}")))?;
        Ok(())
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.lock_conn()?;
        // Range scan from the prefix onward; stop at the first key past it.
        // This avoids LIKE-pattern escaping for keys containing wildcards.
        let mut stmt = conn
            .prepare("SELECT key, value FROM object_metadata WHERE key >= ? ORDER BY key")
            .map_err(|e| StorageNodeError::Backend(format!("preparing scan: {e}")))?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(|e| StorageNodeError::Backend(format!("scanning metadata: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let (key, value) =
                row.map_err(|e| StorageNodeError::Backend(format!("reading scan row: {e}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
            if limit > 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn compact(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch("VACUUM")
            .map_err(|e| StorageNodeError::Backend(format!("vacuuming database: {e}")))?;
        Ok(())
    }
}
