// Metadata module for the object storage node
//
// This module provides metadata persistence behind a pluggable backend
// interface, a bounded LRU cache, and node-local secondary indexes.

use crate::config::MetadataBackendKind;
use crate::error::{Result, StorageNodeError};
use crate::types::ObjectMetadata;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Bounded LRU cache over the metadata store
pub mod cache;
/// Embedded key-value metadata backend
pub mod embedded;
/// Filesystem sidecar metadata backend
pub mod filesystem;
/// Secondary indexes and the query engine
pub mod index;
/// Volatile in-memory metadata backend
pub mod memory;

pub use cache::{CacheStats, MetadataCache};
pub use embedded::EmbeddedKvBackend;
pub use filesystem::FilesystemBackend;
pub use index::{
    IndexEngine, IndexType, LogicalOp, MetadataQuery, QueryCondition, QueryOperator, QueryResult,
    QuerySort,
};
pub use memory::MemoryBackend;

/// Raw byte-level contract every metadata backend fulfills.
///
/// Keys are the object keys; values are opaque to the backend (the store
/// facade encodes them as JSON). `scan` iterates in key order.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Atomically overwrite the value for a key.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value for a key, or `NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Ordered iteration over keys with the given prefix. A zero limit
    /// means unlimited.
    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>>;

    /// Backend-specific space reclaim; may be a no-op.
    async fn compact(&self) -> Result<()>;
}

/// Create a metadata backend of the configured kind rooted at `base_path`.
pub fn create_backend(
    kind: MetadataBackendKind,
    base_path: &Path,
) -> Result<Arc<dyn MetadataBackend>> {
    Ok(match kind {
        MetadataBackendKind::Memory => Arc::new(MemoryBackend::new()),
        MetadataBackendKind::Filesystem => {
            Arc::new(FilesystemBackend::new(base_path.join("metadata"))?)
        }
        MetadataBackendKind::EmbeddedKv => {
            Arc::new(EmbeddedKvBackend::open(base_path.join("metadata.db"))?)
        }
    })
}

/// Typed facade over a raw backend.
///
/// Encodes metadata records as the JSON sidecar schema and maps decode
/// failures to `Corrupted`.
pub struct MetadataStore {
    backend: Arc<dyn MetadataBackend>,
}

impl MetadataStore {
    pub fn new(backend: Arc<dyn MetadataBackend>) -> Self {
        Self { backend }
    }

    /// Persist a metadata record.
    pub async fn put(&self, metadata: &ObjectMetadata) -> Result<()> {
        if metadata.key.is_empty() {
            return Err(StorageNodeError::InvalidKey(
                "metadata key cannot be empty".to_string(),
            ));
        }
        let bytes = serde_json::to_vec(metadata)
            .map_err(|e| StorageNodeError::InvalidValue(format!("metadata encode: {e}")))?;
        self.backend.put(&metadata.key, &bytes).await
    }

    /// Load the metadata record for a key.
    pub async fn get(&self, key: &str) -> Result<ObjectMetadata> {
        let bytes = self.backend.get(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageNodeError::Corrupted(format!("metadata for {key}: {e}")))
    }

    /// Remove the metadata record for a key. Idempotent.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    /// Whether a metadata record exists for the key.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        match self.backend.get(key).await {
            Ok(_) => Ok(true),
            Err(StorageNodeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Decode all records under a prefix, in key order. Records that fail
    /// to decode are skipped and logged rather than aborting the scan.
    pub async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMetadata>> {
        let raw = self.backend.scan(prefix, limit).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (key, bytes) in raw {
            match serde_json::from_slice::<ObjectMetadata>(&bytes) {
                Ok(meta) => out.push(meta),
                Err(e) => {
                    tracing::warn!("skipping undecodable metadata record for {}: {}", key, e);
                }
            }
        }
        Ok(out)
    }

    /// Keys under a prefix, in key order.
    pub async fn scan_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let raw = self.backend.scan(prefix, limit).await?;
        Ok(raw.into_iter().map(|(k, _)| k).collect())
    }

    /// Reclaim backend space.
    pub async fn compact(&self) -> Result<()> {
        self.backend.compact().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectMetadata;

    #[tokio::test]
    async fn store_round_trips_through_json() {
        let store = MetadataStore::new(Arc::new(MemoryBackend::new()));
        let mut meta = ObjectMetadata::new("docs/1");
        meta.size = 5;
        meta.content_type = "text/plain".to_string();
        store.put(&meta).await.unwrap();

        let loaded = store.get("docs/1").await.unwrap();
        assert_eq!(loaded.key, "docs/1");
        assert_eq!(loaded.size, 5);
        assert_eq!(loaded.content_type, "text/plain");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MetadataStore::new(Arc::new(MemoryBackend::new()));
        let err = store.get("missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(!store.contains("missing").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_record_maps_to_corrupted() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("bad", b"{not json").await.unwrap();
        let store = MetadataStore::new(backend);
        let err = store.get("bad").await.unwrap_err();
        assert_eq!(err.code(), "CORRUPTED");
    }

    #[tokio::test]
    async fn empty_key_rejected() {
        let store = MetadataStore::new(Arc::new(MemoryBackend::new()));
        let meta = ObjectMetadata::new("");
        let err = store.put(&meta).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_KEY");
    }
}
