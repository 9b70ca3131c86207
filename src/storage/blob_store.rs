// Crash-safe local blob store
//
// Payloads live under <base>/objects/<key-as-path>, metadata sidecars go
// through the pluggable metadata layer. Writes stream through a SHA-256
// hasher into a temp file and commit with a rename, so a reader observes
// either the previous object or the new one, never a mix.

use crate::error::{Result, StorageNodeError};
use crate::metadata::{IndexEngine, MetadataCache, MetadataStore};
use crate::storage::health::{disk_usage_check, DiskThresholds};
use crate::storage::{validate_key, BatchItem, ObjectReader, Storage};
use crate::types::{
    HealthCheckResult, HealthReport, ListOptions, ListResult, ObjectMetadata, SortField,
    StorageStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const LOCK_STRIPES: usize = 1024;
const WRITE_CHUNK: usize = 64 * 1024;
const TMP_SUFFIX: &str = ".tmp";
const CONSISTENCY_SAMPLE: usize = 50;

/// Fixed-size striped lock table for per-key exclusion.
///
/// Keys hash onto one of the stripes, so memory stays bounded no matter how
/// many keys the store has seen.
struct KeyLockTable {
    stripes: Vec<Mutex<()>>,
}

impl KeyLockTable {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx].lock().await
    }
}

#[derive(Default)]
struct Counters {
    objects: AtomicU64,
    bytes: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Crash-safe local blob storage engine
pub struct BlobStore {
    base_path: PathBuf,
    objects_dir: PathBuf,
    max_size: u64,
    metadata: Arc<MetadataStore>,
    cache: Arc<MetadataCache>,
    indexes: Arc<IndexEngine>,
    key_locks: KeyLockTable,
    counters: Counters,
    running: AtomicBool,
}

impl BlobStore {
    /// Create the store rooted at `base_path`, creating the payload
    /// directory if needed.
    pub fn new(
        base_path: PathBuf,
        max_size: u64,
        metadata: Arc<MetadataStore>,
        cache: Arc<MetadataCache>,
        indexes: Arc<IndexEngine>,
    ) -> Result<Self> {
        let objects_dir = base_path.join("objects");
        std::fs::create_dir_all(&objects_dir)
            .map_err(|e| StorageNodeError::Internal(format!("creating objects directory: {e}")))?;
        Ok(Self {
            base_path,
            objects_dir,
            max_size,
            metadata,
            cache,
            indexes,
            key_locks: KeyLockTable::new(),
            counters: Counters::default(),
            running: AtomicBool::new(false),
        })
    }

    /// The metadata store backing this blob store.
    pub fn metadata_store(&self) -> Arc<MetadataStore> {
        Arc::clone(&self.metadata)
    }

    /// The metadata cache in front of the store.
    pub fn metadata_cache(&self) -> Arc<MetadataCache> {
        Arc::clone(&self.cache)
    }

    /// The secondary index engine over this store's metadata.
    pub fn index_engine(&self) -> Arc<IndexEngine> {
        Arc::clone(&self.indexes)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.objects_dir.join(key)
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.objects_dir.join(format!("{key}{TMP_SUFFIX}"))
    }

    /// Stream the payload into the temp file, hashing as it goes.
    async fn write_payload(&self, tmp_path: &Path, payload: &Bytes) -> Result<(u64, String)> {
        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(|e| StorageNodeError::Internal(format!("creating temp file: {e}")))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        for chunk in payload.chunks(WRITE_CHUNK) {
            written += chunk.len() as u64;
            if self.max_size > 0 && written > self.max_size {
                return Err(StorageNodeError::QuotaExceeded(format!(
                    "payload exceeds max size of {} bytes",
                    self.max_size
                )));
            }
            hasher.update(chunk);
            file.write_all(chunk)
                .await
                .map_err(|e| StorageNodeError::Internal(format!("writing payload: {e}")))?;
        }

        file.sync_all()
            .await
            .map_err(|e| StorageNodeError::Internal(format!("syncing payload: {e}")))?;
        Ok((written, hex::encode(hasher.finalize())))
    }

    async fn previous_metadata(&self, key: &str) -> Option<ObjectMetadata> {
        if let Some(meta) = self.cache.get(key) {
            return Some(meta);
        }
        self.metadata.get(key).await.ok()
    }

    /// Persist the `accessed_at` touch without blocking the reader.
    fn spawn_touch(&self, mut metadata: ObjectMetadata) {
        let store = Arc::clone(&self.metadata);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            metadata.accessed_at = Utc::now();
            if let Err(e) = store.put(&metadata).await {
                warn!("persisting access time for {} failed: {}", metadata.key, e);
                return;
            }
            cache.put(&metadata);
        });
    }

    /// Remove leftover temp files from interrupted writes.
    async fn recover_interrupted_writes(&self) -> Result<usize> {
        let mut removed = 0;
        let mut pending = vec![self.objects_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path
                    .to_str()
                    .map(|s| s.ends_with(TMP_SUFFIX))
                    .unwrap_or(false)
                {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("crash recovery removed {} interrupted writes", removed);
        }
        Ok(removed)
    }

    async fn initialize_counters(&self) -> Result<()> {
        let records = self.metadata.scan("", 0).await?;
        let total_bytes: u64 = records.iter().map(|m| m.size).sum();
        self.counters
            .objects
            .store(records.len() as u64, Ordering::Relaxed);
        self.counters.bytes.store(total_bytes, Ordering::Relaxed);
        Ok(())
    }

    async fn check_metadata_consistency(&self) -> HealthCheckResult {
        let sample = match self.metadata.scan("", CONSISTENCY_SAMPLE).await {
            Ok(sample) => sample,
            Err(e) => return HealthCheckResult::error(format!("metadata scan failed: {e}")),
        };
        let mut mismatches = 0usize;
        for record in &sample {
            match tokio::fs::metadata(self.object_path(&record.key)).await {
                Ok(file_meta) if file_meta.len() == record.size => {}
                Ok(file_meta) => {
                    warn!(
                        "size mismatch for {}: sidecar says {}, disk says {}",
                        record.key,
                        record.size,
                        file_meta.len()
                    );
                    mismatches += 1;
                }
                Err(_) => {
                    warn!("orphaned metadata record for {}", record.key);
                    mismatches += 1;
                }
            }
        }
        if mismatches == 0 {
            HealthCheckResult::ok(format!("{} records sampled, all consistent", sample.len()))
        } else {
            HealthCheckResult::warning(format!(
                "{mismatches} of {} sampled records inconsistent",
                sample.len()
            ))
        }
    }
}

#[async_trait]
impl Storage for BlobStore {
    async fn store(
        &self,
        key: &str,
        payload: Bytes,
        metadata: Option<ObjectMetadata>,
    ) -> Result<ObjectMetadata> {
        validate_key(key)?;
        let guard = self.key_locks.lock(key).await;

        let final_path = self.object_path(key);
        let tmp_path = self.tmp_path(key);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageNodeError::Internal(format!("creating key directory: {e}")))?;
        }

        let (size, hash) = match self.write_payload(&tmp_path, &payload).await {
            Ok(result) => result,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(StorageNodeError::Internal(format!(
                "committing payload: {e}"
            )));
        }

        let previous = self.previous_metadata(key).await;
        let now = Utc::now();
        let mut meta = metadata.unwrap_or_else(|| match &previous {
            Some(prev) => prev.clone(),
            None => ObjectMetadata::new(key),
        });
        meta.key = key.to_string();
        meta.size = size;
        meta.hash = hash;
        meta.updated_at = now;
        meta.accessed_at = now;
        match &previous {
            Some(prev) => {
                meta.created_at = prev.created_at;
                meta.version = prev.version.clone();
                meta.bump_version();
            }
            None => meta.created_at = now,
        }

        if let Err(e) = self.metadata.put(&meta).await {
            // Never leave a payload without its sidecar.
            let _ = tokio::fs::remove_file(&final_path).await;
            self.cache.invalidate(key);
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        drop(guard);

        self.cache.put(&meta);
        self.indexes.note_update(previous.as_ref(), &meta);

        match &previous {
            Some(prev) => {
                self.counters.bytes.fetch_sub(prev.size, Ordering::Relaxed);
            }
            None => {
                self.counters.objects.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.bytes.fetch_add(size, Ordering::Relaxed);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!("stored {} ({} bytes)", key, size);
        Ok(meta)
    }

    async fn retrieve(&self, key: &str) -> Result<(ObjectReader, ObjectMetadata)> {
        validate_key(key)?;
        let file = match tokio::fs::File::open(self.object_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageNodeError::NotFound(format!("object {key}")));
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(StorageNodeError::Internal(format!("opening payload: {e}")));
            }
        };

        let metadata = match self.cache.get(key) {
            Some(metadata) => metadata,
            None => match self.metadata.get(key).await {
                Ok(metadata) => {
                    self.cache.put(&metadata);
                    metadata
                }
                Err(StorageNodeError::NotFound(_)) => {
                    return Err(StorageNodeError::Corrupted(format!(
                        "payload for {key} has no metadata record"
                    )));
                }
                Err(e) => return Err(e),
            },
        };

        self.spawn_touch(metadata.clone());
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok((ObjectReader::from_file(file), metadata))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let guard = self.key_locks.lock(key).await;

        let previous = self.previous_metadata(key).await;
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(StorageNodeError::Internal(format!(
                    "removing payload: {e}"
                )));
            }
        }
        self.metadata.delete(key).await?;
        drop(guard);

        self.cache.invalidate(key);
        self.indexes.note_delete(key);
        if let Some(prev) = previous {
            self.counters.objects.fetch_sub(1, Ordering::Relaxed);
            self.counters.bytes.fetch_sub(prev.size, Ordering::Relaxed);
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let payload_present = tokio::fs::metadata(self.object_path(key)).await.is_ok();
        if !payload_present {
            return Ok(false);
        }
        self.metadata.contains(key).await
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata> {
        validate_key(key)?;
        if let Some(metadata) = self.cache.get(key) {
            return Ok(metadata);
        }
        let metadata = self.metadata.get(key).await?;
        self.cache.put(&metadata);
        Ok(metadata)
    }

    async fn set_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<ObjectMetadata> {
        validate_key(key)?;
        let guard = self.key_locks.lock(key).await;

        let existing = self.metadata.get(key).await?;
        let mut updated = metadata;
        updated.key = existing.key.clone();
        updated.size = existing.size;
        updated.hash = existing.hash.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Utc::now();
        self.metadata.put(&updated).await?;
        drop(guard);

        self.cache.put(&updated);
        self.indexes.note_update(Some(&existing), &updated);
        Ok(updated)
    }

    async fn batch_store(&self, items: Vec<BatchItem>) -> Result<Vec<ObjectMetadata>> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut failures: Vec<(String, String)> = Vec::new();
        for item in items {
            match self.store(&item.key, item.payload, item.metadata).await {
                Ok(meta) => results.push(meta),
                Err(e) => failures.push((item.key, e.to_string())),
            }
        }
        if failures.is_empty() {
            Ok(results)
        } else {
            let (first_key, first_err) = &failures[0];
            Err(StorageNodeError::Internal(format!(
                "batch store: {} of {total} operations failed; first failure on {first_key}: {first_err}",
                failures.len()
            )))
        }
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let total = keys.len();
        let mut failures: Vec<(String, String)> = Vec::new();
        for key in keys {
            if let Err(e) = self.delete(key).await {
                failures.push((key.clone(), e.to_string()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            let (first_key, first_err) = &failures[0];
            Err(StorageNodeError::Internal(format!(
                "batch delete: {} of {total} operations failed; first failure on {first_key}: {first_err}",
                failures.len()
            )))
        }
    }

    async fn list(&self, options: &ListOptions) -> Result<ListResult> {
        let mut objects = self.metadata.scan(&options.prefix, 0).await?;
        let total = objects.len();

        match options.sort.unwrap_or(SortField::Name) {
            SortField::Name => objects.sort_by(|a, b| a.key.cmp(&b.key)),
            SortField::Size => {
                objects.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.key.cmp(&b.key)))
            }
            SortField::Modified => objects.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.key.cmp(&b.key))
            }),
        }
        if options.descending {
            objects.reverse();
        }

        let offset = match &options.continuation {
            Some(token) => decode_continuation(token)?,
            None => 0,
        };
        let offset = offset.min(total);
        let mut page: Vec<ObjectMetadata> = objects.split_off(offset);
        if options.limit > 0 && page.len() > options.limit {
            page.truncate(options.limit);
        }
        let consumed = offset + page.len();
        let next_continuation = if consumed < total {
            Some(encode_continuation(consumed))
        } else {
            None
        };

        Ok(ListResult {
            objects: page,
            total,
            next_continuation,
        })
    }

    async fn list_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.metadata.scan_keys(prefix, limit).await
    }

    async fn health_check(&self) -> Result<HealthReport> {
        let mut checks = HashMap::new();

        checks.insert(
            "disk_usage".to_string(),
            disk_usage_check(&self.base_path, DiskThresholds::default()),
        );

        let probe_key = format!(".healthcheck/probe-{}", uuid::Uuid::new_v4());
        let probe_payload = Bytes::from_static(b"healthcheck");
        let write_check = match self.store(&probe_key, probe_payload.clone(), None).await {
            Ok(_) => HealthCheckResult::ok("round-trip write succeeded"),
            Err(e) => HealthCheckResult::error(format!("write test failed: {e}")),
        };
        let write_ok = write_check.status == crate::types::CheckStatus::Ok;
        checks.insert("write_test".to_string(), write_check);

        let read_check = if write_ok {
            match self.retrieve(&probe_key).await {
                Ok((reader, meta)) => match reader.read_to_bytes().await {
                    Ok(bytes) if bytes == probe_payload && meta.size == bytes.len() as u64 => {
                        HealthCheckResult::ok("round-trip read succeeded")
                    }
                    Ok(_) => HealthCheckResult::error("read test returned wrong payload"),
                    Err(e) => HealthCheckResult::error(format!("read test failed: {e}")),
                },
                Err(e) => HealthCheckResult::error(format!("read test failed: {e}")),
            }
        } else {
            HealthCheckResult::warning("skipped: write test failed")
        };
        checks.insert("read_test".to_string(), read_check);
        let _ = self.delete(&probe_key).await;

        let dirs_ok = self.objects_dir.is_dir();
        checks.insert(
            "directory_integrity".to_string(),
            if dirs_ok {
                HealthCheckResult::ok("storage directories present")
            } else {
                HealthCheckResult::error("objects directory missing")
            },
        );

        checks.insert(
            "metadata_consistency".to_string(),
            self.check_metadata_consistency().await,
        );

        Ok(HealthReport::from_checks(checks))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_objects: self.counters.objects.load(Ordering::Relaxed),
            total_bytes: self.counters.bytes.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            cache_hit_rate: self.cache.hit_rate(),
            last_updated: Utc::now(),
        })
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.recover_interrupted_writes().await?;
        self.initialize_counters().await?;
        MetadataCache::start_maintenance(&self.cache);
        info!(
            "blob store started at {} ({} objects)",
            self.base_path.display(),
            self.counters.objects.load(Ordering::Relaxed)
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn encode_continuation(offset: usize) -> String {
    hex::encode(offset.to_string())
}

fn decode_continuation(token: &str) -> Result<usize> {
    let bytes = hex::decode(token)
        .map_err(|_| StorageNodeError::InvalidArgument("malformed continuation token".into()))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| StorageNodeError::InvalidArgument("malformed continuation token".into()))?;
    text.parse::<usize>()
        .map_err(|_| StorageNodeError::InvalidArgument("malformed continuation token".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MemoryBackend, MetadataStore};

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn new_store(max_size: u64) -> Arc<BlobStore> {
        let base = std::env::temp_dir().join(format!("blob-test-{}", uuid::Uuid::new_v4()));
        let metadata = Arc::new(MetadataStore::new(Arc::new(MemoryBackend::new())));
        let cache = Arc::new(MetadataCache::new(128));
        let indexes = Arc::new(IndexEngine::new(Arc::clone(&metadata), Arc::clone(&cache)));
        Arc::new(BlobStore::new(base, max_size, metadata, cache, indexes).unwrap())
    }

    #[tokio::test]
    async fn store_then_retrieve_returns_payload_and_hash() {
        let store = new_store(0);
        let mut meta_in = ObjectMetadata::new("docs/1");
        meta_in.content_type = "text/plain".to_string();

        let stored = store
            .store("docs/1", Bytes::from_static(b"hello"), Some(meta_in))
            .await
            .unwrap();
        assert_eq!(stored.size, 5);
        assert_eq!(stored.hash, HELLO_SHA256);
        assert_eq!(stored.content_type, "text/plain");

        let (reader, meta) = store.retrieve("docs/1").await.unwrap();
        let bytes = reader.read_to_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(meta.hash, HELLO_SHA256);
        assert_eq!(meta.size, 5);
    }

    #[tokio::test]
    async fn retrieve_missing_is_not_found() {
        let store = new_store(0);
        let err = store.retrieve("absent").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = new_store(0);
        store
            .store("docs/1", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        store.delete("docs/1").await.unwrap();
        store.delete("docs/1").await.unwrap();
        assert!(!store.exists("docs/1").await.unwrap());
        assert_eq!(store.retrieve("docs/1").await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn quota_boundary_is_exact() {
        let store = new_store(4);
        store
            .store("fits", Bytes::from_static(b"1234"), None)
            .await
            .unwrap();

        let err = store
            .store("too-big", Bytes::from_static(b"12345"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        // The failed write leaves nothing behind.
        assert!(!store.exists("too-big").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_bumps_version_and_keeps_created_at() {
        let store = new_store(0);
        let first = store
            .store("k", Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        let second = store
            .store("k", Bytes::from_static(b"two"), None)
            .await
            .unwrap();

        assert_eq!(first.version, "1");
        assert_eq!(second.version, "2");
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.size, 3);
    }

    #[tokio::test]
    async fn list_orders_by_name_and_counts_matches() {
        let store = new_store(0);
        for (key, payload) in [("a/1", "1"), ("a/2", "2"), ("b/1", "3")] {
            store
                .store(key, Bytes::from(payload.as_bytes().to_vec()), None)
                .await
                .unwrap();
        }

        let result = store
            .list(&ListOptions {
                prefix: "a/".to_string(),
                limit: 10,
                sort: Some(SortField::Name),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 2);
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert!(result.next_continuation.is_none());
    }

    #[tokio::test]
    async fn list_continuation_pages_through_results() {
        let store = new_store(0);
        for key in ["p/1", "p/2", "p/3"] {
            store
                .store(key, Bytes::from_static(b"x"), None)
                .await
                .unwrap();
        }

        let first = store
            .list(&ListOptions {
                prefix: "p/".to_string(),
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.objects.len(), 2);
        let token = first.next_continuation.clone().unwrap();

        let second = store
            .list(&ListOptions {
                prefix: "p/".to_string(),
                limit: 2,
                continuation: Some(token),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "p/3");
        assert!(second.next_continuation.is_none());
    }

    #[tokio::test]
    async fn batch_store_is_equivalent_to_sequential() {
        let store = new_store(0);
        let items = vec![
            BatchItem {
                key: "b/1".to_string(),
                payload: Bytes::from_static(b"one"),
                metadata: None,
            },
            BatchItem {
                key: "b/2".to_string(),
                payload: Bytes::from_static(b"two"),
                metadata: None,
            },
        ];
        let stored = store.batch_store(items).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(store.exists("b/1").await.unwrap());
        assert!(store.exists("b/2").await.unwrap());

        store
            .batch_delete(&["b/1".to_string(), "b/2".to_string()])
            .await
            .unwrap();
        assert!(!store.exists("b/1").await.unwrap());
    }

    #[tokio::test]
    async fn batch_store_reports_aggregate_failure() {
        let store = new_store(3);
        let items = vec![
            BatchItem {
                key: "ok".to_string(),
                payload: Bytes::from_static(b"abc"),
                metadata: None,
            },
            BatchItem {
                key: "big".to_string(),
                payload: Bytes::from_static(b"abcdef"),
                metadata: None,
            },
        ];
        let err = store.batch_store(items).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(err.to_string().contains("1 of 2"));
        // The successful sub-operation still applied.
        assert!(store.exists("ok").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_key_leave_one_payload() {
        let store = new_store(0);
        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .store("contended", Bytes::from_static(b"aaaa"), None)
                    .await
            })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .store("contended", Bytes::from_static(b"bbbbbb"), None)
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let (reader, meta) = store.retrieve("contended").await.unwrap();
        let bytes = reader.read_to_bytes().await.unwrap();
        assert_eq!(meta.size, bytes.len() as u64);
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(meta.hash, hex::encode(hasher.finalize()));
        assert!(bytes[..] == b"aaaa"[..] || bytes[..] == b"bbbbbb"[..]);
    }

    #[tokio::test]
    async fn crash_recovery_removes_stale_temp_files() {
        let store = new_store(0);
        store
            .store("keep", Bytes::from_static(b"data"), None)
            .await
            .unwrap();
        let stale = store.objects_dir.join("stale.tmp");
        tokio::fs::write(&stale, b"partial").await.unwrap();

        store.start().await.unwrap();
        assert!(!stale.exists());
        assert!(store.exists("keep").await.unwrap());

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_objects, 1);
        assert_eq!(stats.total_bytes, 4);
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let store = new_store(0);
        let report = store.health_check().await.unwrap();
        assert!(report.checks.contains_key("write_test"));
        assert!(report.checks.contains_key("read_test"));
        assert!(report.checks.contains_key("metadata_consistency"));
        assert_eq!(
            report.checks["write_test"].status,
            crate::types::CheckStatus::Ok
        );
        assert_eq!(
            report.checks["read_test"].status,
            crate::types::CheckStatus::Ok
        );
    }

    #[tokio::test]
    async fn cache_stays_subset_of_store() {
        let store = new_store(0);
        store
            .store("k", Bytes::from_static(b"v"), None)
            .await
            .unwrap();
        assert!(store.metadata_cache().get("k").is_some());

        store.delete("k").await.unwrap();
        assert!(store.metadata_cache().get("k").is_none());
        assert!(!store.metadata_store().contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_metadata_preserves_computed_fields() {
        let store = new_store(0);
        let stored = store
            .store("k", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        let mut update = ObjectMetadata::new("k");
        update.content_type = "text/markdown".to_string();
        update.size = 9999;
        update.hash = "bogus".to_string();
        let updated = store.set_metadata("k", update).await.unwrap();

        assert_eq!(updated.content_type, "text/markdown");
        assert_eq!(updated.size, stored.size);
        assert_eq!(updated.hash, stored.hash);
        assert_eq!(updated.created_at, stored.created_at);
    }
}
