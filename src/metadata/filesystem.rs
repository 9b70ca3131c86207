// Filesystem metadata backend
//
// Persists one sidecar file per key under the metadata directory. The key's
// `/` separators map to path separators and `.meta` is appended. Writes go
// through a temp file, fsync, and rename so readers observe either the old
// record or the new one, never a torn write.

use crate::error::{Result, StorageNodeError};
use crate::metadata::MetadataBackend;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".meta.tmp";

/// Metadata backend storing one `.meta` file per key
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create the backend, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            StorageNodeError::Backend(format!("creating metadata directory: {e}"))
        })?;
        Ok(Self { root })
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{META_SUFFIX}"))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{TMP_SUFFIX}"))
    }

    fn key_from_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let s = rel.to_str()?;
        let key = s.strip_suffix(META_SUFFIX)?;
        // Normalize platform separators back to the logical `/`.
        Some(key.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

#[async_trait]
impl MetadataBackend for FilesystemBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let final_path = self.sidecar_path(key);
        let tmp_path = self.tmp_path(key);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageNodeError::Backend(format!("creating sidecar directory: {e}"))
            })?;
        }

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| StorageNodeError::Backend(format!("creating sidecar temp: {e}")))?;
        if let Err(e) = async {
            file.write_all(value).await?;
            file.sync_all().await
        }
        .await
        {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StorageNodeError::Backend(format!("writing sidecar: {e}")));
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StorageNodeError::Backend(format!("committing sidecar: {e}")));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.sidecar_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageNodeError::NotFound(format!("metadata key {key}")))
            }
            Err(e) => Err(StorageNodeError::Backend(format!("reading sidecar: {e}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.sidecar_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageNodeError::Backend(format!("removing sidecar: {e}"))),
        }
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StorageNodeError::Backend(format!(
                        "scanning metadata directory: {e}"
                    )))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageNodeError::Backend(format!("scanning metadata: {e}")))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageNodeError::Backend(format!("scanning metadata: {e}")))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_from_path(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        if limit > 0 {
            keys.truncate(limit);
        }

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            // A record may vanish between the walk and the read; skip it.
            match self.get(&key).await {
                Ok(bytes) => out.push((key, bytes)),
                Err(StorageNodeError::NotFound(_)) => {
                    debug!("sidecar for {} disappeared during scan", key);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn compact(&self) -> Result<()> {
        // Leftover temp files are the only reclaimable space here.
        let mut pending = vec![self.root.clone()];
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
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("fs-meta-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let backend = FilesystemBackend::new(temp_root()).unwrap();
        backend.put("docs/1", b"{\"a\":1}").await.unwrap();
        assert_eq!(backend.get("docs/1").await.unwrap(), b"{\"a\":1}");

        backend.delete("docs/1").await.unwrap();
        backend.delete("docs/1").await.unwrap();
        assert!(backend.get("docs/1").await.is_err());
    }

    #[tokio::test]
    async fn nested_keys_map_to_directories() {
        let root = temp_root();
        let backend = FilesystemBackend::new(root.clone()).unwrap();
        backend.put("a/b/c", b"v").await.unwrap();
        assert!(root.join("a/b/c.meta").exists());

        let scanned = backend.scan("a/", 0).await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, "a/b/c");
    }

    #[tokio::test]
    async fn scan_orders_keys_and_applies_limit() {
        let backend = FilesystemBackend::new(temp_root()).unwrap();
        for key in ["b/1", "a/2", "a/1", "c"] {
            backend.put(key, key.as_bytes()).await.unwrap();
        }

        let all = backend.scan("", 0).await.unwrap();
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2", "b/1", "c"]);

        let page = backend.scan("a/", 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, "a/1");
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let backend = FilesystemBackend::new(temp_root()).unwrap();
        backend.put("k", b"old").await.unwrap();
        backend.put("k", b"new").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), b"new");
    }
}
