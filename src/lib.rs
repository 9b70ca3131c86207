// Distributed Object Storage Node
//
// This crate implements the durable substrate of a distributed system: opaque
// byte blobs addressed by string keys, persisted crash-safely on a single node
// and replicated across a cluster according to per-key policies.
//
// # Architecture
//
// The node is built around several modular components:
//
// * **Blob Store**: content-addressed local persistence with atomic writes,
//   SHA-256 verification, and a JSON metadata sidecar per object
// * **Metadata Layer**: pluggable key/metadata backends with a bounded LRU
//   cache and node-local secondary indexes
// * **Cluster Layer**: node membership, heartbeats, and failure detection
// * **Replication Layer**: strategy-driven target selection and a bounded
//   worker pool that pushes replicas to peers
// * **Distributed Façade**: a single entry point composing all of the above
//
// # Usage
//
// ```rust,no_run
// use object_storage_node::config::StorageNodeConfig;
// use object_storage_node::storage::{Storage, StorageFactory};
// use bytes::Bytes;
//
// async fn example() -> object_storage_node::error::Result<()> {
//     let config = StorageNodeConfig::default();
//     let factory = StorageFactory::new(config);
//     let store = factory.create_blob_store()?;
//     store.start().await?;
//
//     store.store("docs/1", Bytes::from_static(b"hello"), None).await?;
//     let (_reader, _metadata) = store.retrieve("docs/1").await?;
//     Ok(())
// }
// ```

/// Node membership and cluster state.
///
/// Maintains the registry of known storage nodes, probes their health on a
/// heartbeat interval, sweeps for silent failures, and selects nodes for
/// placement using load-balanced, capacity-based, or geographic strategies.
pub mod cluster;

/// Typed configuration for the storage node.
///
/// Plain serde structs with defaults; parsing config files is the host
/// application's job.
pub mod config;

/// Distributed locks and the consensus state oracle.
///
/// The lock registry hands out named, leased, renewable exclusive locks.
/// The consensus oracle is a read-only view of cluster leadership supplied
/// by an external consensus implementation.
pub mod coordination;

/// Distributed storage façade.
///
/// Composes the local blob store, metadata layer, cluster membership, lock
/// registry, and replication coordinator behind one `DistributedStorage`
/// API, and aggregates health and metrics across all of them.
pub mod distributed;

/// Error types for the storage node.
///
/// A single error enum covering the full taxonomy (not-found, quota,
/// corruption, timeouts, backend failures), each variant carrying a stable
/// machine-readable code string.
pub mod error;

/// Metadata persistence, caching, and indexing.
///
/// * Pluggable `MetadataBackend` implementations (embedded KV, filesystem,
///   in-memory)
/// * A bounded LRU metadata cache with hit/miss accounting
/// * Node-local secondary indexes over metadata fields with a constrained
///   query engine
pub mod metadata;

/// Replication policies, strategies, transport, and the coordinator.
///
/// Placement strategies (eager, lazy, geographic) pick target nodes; the
/// coordinator owns bounded work queues and worker pools that push replicas
/// to peers through the injected `PeerTransport`.
pub mod replication;

/// Local object storage.
///
/// The `Storage` trait, the crash-safe `BlobStore` implementation, and the
/// storage health checks.
pub mod storage;

/// Common types used throughout the storage node.
pub mod types;

// Re-export commonly used types for convenience
pub use types::*;
