//! # Storage Module for the Object Storage Node
//!
//! This module provides the core local storage functionality: the `Storage`
//! trait every engine implements, the crash-safe `BlobStore`, and the
//! storage health checks.
//!
//! ## Key Features
//!
//! * Atomic payload writes (temp file + fsync + rename)
//! * SHA-256 content hashing computed in the write path
//! * JSON metadata sidecars through the pluggable metadata layer
//! * Per-key concurrency control via a striped lock table
//! * Listing with prefix filters, sorting, and continuation tokens
//!
//! ## Usage
//!
//! Storage engines are typically created through the `StorageFactory`,
//! which wires the metadata backend, cache, and index engine:
//!
//! ```rust,no_run
//! use object_storage_node::config::StorageNodeConfig;
//! use object_storage_node::storage::StorageFactory;
//!
//! # fn example() -> object_storage_node::error::Result<()> {
//! let factory = StorageFactory::new(StorageNodeConfig::default());
//! let store = factory.create_blob_store()?;
//! # Ok(())
//! # }
//! ```

use crate::config::{IndexingMode, StorageNodeConfig};
use crate::error::{Result, StorageNodeError};
use crate::metadata::{create_backend, IndexEngine, MetadataCache, MetadataStore};
use crate::types::{
    HealthReport, ListOptions, ListResult, ObjectMetadata, StorageStats, MAX_KEY_LENGTH,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Crash-safe local blob storage
pub mod blob_store;
/// Health checking helpers
pub mod health;

pub use blob_store::BlobStore;
pub use health::{disk_usage_check, DiskThresholds};

/// Validate a storage key.
///
/// Rejected: empty keys, keys longer than 255 bytes, keys containing `..`,
/// and keys with control bytes (<0x20) or DEL (0x7F).
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageNodeError::InvalidArgument(
            "key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageNodeError::InvalidArgument(format!(
            "key exceeds {MAX_KEY_LENGTH} bytes"
        )));
    }
    if key.contains("..") {
        return Err(StorageNodeError::InvalidArgument(
            "key must not contain '..'".to_string(),
        ));
    }
    if key.bytes().any(|b| b < 0x20 || b == 0x7F) {
        return Err(StorageNodeError::InvalidArgument(
            "key must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
enum ReaderInner {
    File(tokio::fs::File),
    Memory(Cursor<Bytes>),
}

/// Streaming handle over an object payload.
///
/// Wraps either an open payload file or an in-memory buffer (for payloads
/// fetched from peers) behind one `AsyncRead` type.
#[derive(Debug)]
pub struct ObjectReader {
    inner: ReaderInner,
}

impl ObjectReader {
    /// Reader over an open payload file.
    pub fn from_file(file: tokio::fs::File) -> Self {
        Self {
            inner: ReaderInner::File(file),
        }
    }

    /// Reader over an in-memory payload.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            inner: ReaderInner::Memory(Cursor::new(bytes)),
        }
    }

    /// Drain the reader into one buffer.
    pub async fn read_to_bytes(mut self) -> Result<Bytes> {
        match self.inner {
            ReaderInner::Memory(cursor) => Ok(cursor.into_inner()),
            ReaderInner::File(_) => {
                let mut buf = Vec::new();
                self.read_to_end(&mut buf)
                    .await
                    .map_err(|e| StorageNodeError::Internal(format!("reading payload: {e}")))?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            ReaderInner::File(file) => Pin::new(file).poll_read(cx, buf),
            ReaderInner::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
        }
    }
}

/// One entry of a batch store request
pub struct BatchItem {
    /// Object key
    pub key: String,

    /// Payload bytes
    pub payload: Bytes,

    /// Optional caller-supplied metadata
    pub metadata: Option<ObjectMetadata>,
}

/// Core interface implemented by every storage engine.
///
/// All methods are asynchronous; local engines suspend on disk I/O and
/// distributed engines additionally on peer calls.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably store a payload under a key, returning the final metadata.
    async fn store(
        &self,
        key: &str,
        payload: Bytes,
        metadata: Option<ObjectMetadata>,
    ) -> Result<ObjectMetadata>;

    /// Open a streaming handle over a stored payload plus its metadata.
    async fn retrieve(&self, key: &str) -> Result<(ObjectReader, ObjectMetadata)>;

    /// Remove a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether the key holds a fully stored object.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Load the metadata record for a key.
    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata>;

    /// Replace the caller-controlled metadata fields for a key.
    ///
    /// The computed fields (`key`, `size`, `hash`, `created_at`) are
    /// preserved from the stored record.
    async fn set_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<ObjectMetadata>;

    /// Store several objects sequentially; fails if any sub-store fails.
    async fn batch_store(&self, items: Vec<BatchItem>) -> Result<Vec<ObjectMetadata>>;

    /// Delete several keys sequentially; fails if any sub-delete fails.
    async fn batch_delete(&self, keys: &[String]) -> Result<()>;

    /// List objects by prefix with optional sorting and pagination.
    async fn list(&self, options: &ListOptions) -> Result<ListResult>;

    /// List keys by prefix in key order.
    async fn list_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Run the health sub-checks and aggregate a report.
    async fn health_check(&self) -> Result<HealthReport>;

    /// Storage statistics snapshot.
    async fn get_stats(&self) -> Result<StorageStats>;

    /// Start background maintenance and run crash recovery.
    async fn start(&self) -> Result<()>;

    /// Stop background maintenance.
    async fn stop(&self) -> Result<()>;
}

/// Factory wiring the local storage stack from configuration.
pub struct StorageFactory {
    config: StorageNodeConfig,
}

impl StorageFactory {
    /// Create a new storage factory with the given configuration.
    pub fn new(config: StorageNodeConfig) -> Self {
        Self { config }
    }

    /// Build the local blob store with its metadata backend, cache, and
    /// index engine.
    pub fn create_blob_store(&self) -> Result<Arc<BlobStore>> {
        let backend = create_backend(self.config.metadata.backend, &self.config.base_path)?;
        let metadata = Arc::new(MetadataStore::new(backend));
        let cache = Arc::new(MetadataCache::new(self.config.max_cache_size));
        let indexes = Arc::new(IndexEngine::new(Arc::clone(&metadata), Arc::clone(&cache)));

        match self.config.indexing_mode {
            IndexingMode::Eager => indexes.create_default_indexes(true)?,
            IndexingMode::Lazy => indexes.create_default_indexes(false)?,
            IndexingMode::Disabled => {}
        }

        Ok(Arc::new(BlobStore::new(
            self.config.base_path.clone(),
            self.config.max_size,
            metadata,
            cache,
            indexes,
        )?))
    }

    /// The configuration this factory was built with.
    pub fn config(&self) -> &StorageNodeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation_boundaries() {
        assert!(validate_key("docs/1").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH)).is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("a\x01b").is_err());
        assert!(validate_key("a\x7Fb").is_err());
        assert!(validate_key("line\nbreak").is_err());
    }

    #[tokio::test]
    async fn object_reader_round_trips_memory() {
        let reader = ObjectReader::from_bytes(Bytes::from_static(b"payload"));
        let bytes = reader.read_to_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"payload");
    }
}
