// In-memory metadata backend
//
// Volatile map-backed storage, used for tests and single-process setups.

use crate::error::{Result, StorageNodeError};
use crate::metadata::MetadataBackend;
use async_trait::async_trait;
use dashmap::DashMap;

/// Metadata backend backed by a concurrent in-memory map
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl MetadataBackend for MemoryBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| StorageNodeError::NotFound(format!("metadata key {key}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let mut matches: Vec<(String, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        if limit > 0 {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_is_ordered_and_prefix_filtered() {
        let backend = MemoryBackend::new();
        backend.put("b/2", b"2").await.unwrap();
        backend.put("a/1", b"1").await.unwrap();
        backend.put("a/2", b"2").await.unwrap();

        let all = backend.scan("a/", 0).await.unwrap();
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);

        let limited = backend.scan("", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].0, "a/1");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.put("k", b"v").await.unwrap();
        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(backend.get("k").await.is_err());
    }
}
