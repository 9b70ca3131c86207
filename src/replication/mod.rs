// Replication module for the object storage node
//
// Policy-driven placement and the machinery that pushes replicas to peers:
// strategies pick target nodes, the coordinator owns bounded work queues
// and worker pools, and the `PeerTransport` trait is the seam to the wire.

use crate::error::Result;
use crate::storage::Storage;
use crate::types::ObjectMetadata;
use async_trait::async_trait;
use bytes::Bytes;

/// Replication coordinator and operation tracking
pub mod coordinator;
/// Placement policies and strategies
pub mod policy;
/// Peer transport interface and the in-memory implementation
pub mod transport;

pub use coordinator::{LocalObjectSource, ReplicationCoordinator, ReplicationHandle};
pub use policy::validate_policy;
pub use transport::{MemoryTransport, PeerTransport, ProbeResult};

// The blob store is the coordinator's local object source: workers read
// payloads through this narrow surface instead of holding the whole façade.
#[async_trait]
impl LocalObjectSource for crate::storage::BlobStore {
    async fn read_object(&self, key: &str) -> Result<(Bytes, ObjectMetadata)> {
        let (reader, metadata) = self.retrieve(key).await?;
        let bytes = reader.read_to_bytes().await?;
        Ok((bytes, metadata))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        self.exists(key).await
    }
}
