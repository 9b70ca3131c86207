// Peer transport interface
//
// Semantic contract between the replication machinery and whatever wire
// protocol the host application supplies. The in-memory implementation
// backs tests and single-process clusters, with injectable failures and
// latency.

use crate::error::{Result, StorageNodeError};
use crate::storage::Storage;
use crate::types::{NodeId, ObjectMetadata, StorageNode};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of probing a peer
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Whether the peer answered
    pub healthy: bool,

    /// Round-trip time of the probe
    pub response_time: Duration,
}

/// Transport used for all peer calls.
///
/// Implementations own connection management and the wire format; every
/// call is bounded by the supplied deadline.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Push one object (payload plus metadata) to a peer.
    async fn replicate(
        &self,
        target: &StorageNode,
        key: &str,
        payload: Bytes,
        metadata: &ObjectMetadata,
        deadline: Duration,
    ) -> Result<()>;

    /// Fetch an object from a peer.
    async fn retrieve(
        &self,
        target: &StorageNode,
        key: &str,
        deadline: Duration,
    ) -> Result<(Bytes, ObjectMetadata)>;

    /// Delete an object's replica on a peer.
    async fn delete(&self, target: &StorageNode, key: &str, deadline: Duration) -> Result<()>;

    /// Liveness probe.
    async fn probe(&self, target: &StorageNode, deadline: Duration) -> Result<ProbeResult>;
}

/// In-process transport connecting storage engines by node id.
///
/// Peers register their local store; calls dispatch directly. Nodes can be
/// marked failed to simulate outages, and a fixed latency can be injected
/// to exercise timeout paths.
#[derive(Default)]
pub struct MemoryTransport {
    stores: DashMap<NodeId, Arc<dyn Storage>>,
    failed: DashSet<NodeId>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport where every call sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    /// Attach a node's local store.
    pub fn register(&self, node_id: impl Into<NodeId>, store: Arc<dyn Storage>) {
        self.stores.insert(node_id.into(), store);
    }

    /// Detach a node.
    pub fn unregister(&self, node_id: &str) {
        self.stores.remove(node_id);
    }

    /// Simulate an outage for a node.
    pub fn set_failed(&self, node_id: impl Into<NodeId>, failed: bool) {
        let node_id = node_id.into();
        if failed {
            self.failed.insert(node_id);
        } else {
            self.failed.remove(&node_id);
        }
    }

    async fn checked_store(&self, target: &StorageNode) -> Result<Arc<dyn Storage>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failed.contains(&target.id) {
            return Err(StorageNodeError::Unavailable(format!(
                "node {} is unreachable",
                target.id
            )));
        }
        self.stores
            .get(&target.id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                StorageNodeError::Unavailable(format!("node {} is not registered", target.id))
            })
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn replicate(
        &self,
        target: &StorageNode,
        key: &str,
        payload: Bytes,
        metadata: &ObjectMetadata,
        _deadline: Duration,
    ) -> Result<()> {
        let store = self.checked_store(target).await?;
        store.store(key, payload, Some(metadata.clone())).await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        target: &StorageNode,
        key: &str,
        _deadline: Duration,
    ) -> Result<(Bytes, ObjectMetadata)> {
        let store = self.checked_store(target).await?;
        let (reader, metadata) = store.retrieve(key).await?;
        let bytes = reader.read_to_bytes().await?;
        Ok((bytes, metadata))
    }

    async fn delete(&self, target: &StorageNode, key: &str, _deadline: Duration) -> Result<()> {
        let store = self.checked_store(target).await?;
        store.delete(key).await
    }

    async fn probe(&self, target: &StorageNode, _deadline: Duration) -> Result<ProbeResult> {
        let started = Instant::now();
        self.checked_store(target).await?;
        Ok(ProbeResult {
            healthy: true,
            response_time: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{IndexEngine, MemoryBackend, MetadataCache, MetadataStore};
    use crate::storage::BlobStore;

    fn blob_store() -> Arc<BlobStore> {
        let base = std::env::temp_dir().join(format!("transport-test-{}", uuid::Uuid::new_v4()));
        let metadata = Arc::new(MetadataStore::new(Arc::new(MemoryBackend::new())));
        let cache = Arc::new(MetadataCache::new(64));
        let indexes = Arc::new(IndexEngine::new(Arc::clone(&metadata), Arc::clone(&cache)));
        Arc::new(BlobStore::new(base, 0, metadata, cache, indexes).unwrap())
    }

    fn node(id: &str) -> StorageNode {
        StorageNode::new(id, format!("{id}:7000"), "r1")
    }

    #[tokio::test]
    async fn replicate_then_retrieve_round_trips() {
        let transport = MemoryTransport::new();
        let peer = blob_store();
        transport.register("peer-1", peer.clone());

        let mut meta = ObjectMetadata::new("k");
        meta.content_type = "text/plain".to_string();
        transport
            .replicate(
                &node("peer-1"),
                "k",
                Bytes::from_static(b"payload"),
                &meta,
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let (bytes, fetched) = transport
            .retrieve(&node("peer-1"), "k", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(fetched.content_type, "text/plain");
    }

    #[tokio::test]
    async fn failed_node_is_unavailable() {
        let transport = MemoryTransport::new();
        transport.register("peer-1", blob_store());
        transport.set_failed("peer-1", true);

        let err = transport
            .probe(&node("peer-1"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");

        transport.set_failed("peer-1", false);
        assert!(transport
            .probe(&node("peer-1"), Duration::from_secs(1))
            .await
            .unwrap()
            .healthy);
    }

    #[tokio::test]
    async fn unregistered_node_is_unavailable() {
        let transport = MemoryTransport::new();
        let err = transport
            .retrieve(&node("ghost"), "k", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }
}
