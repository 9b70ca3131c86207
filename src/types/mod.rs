// Types module for the object storage node
//
// This module defines common types used throughout the storage node:
// object metadata, node records, replication policies and status, and the
// option/result types of the listing API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Node identifier
pub type NodeId = String;

/// Geographic region identifier
pub type RegionId = String;

/// Maximum key length accepted by the store
pub const MAX_KEY_LENGTH: usize = 255;

/// Metadata record kept for every stored object.
///
/// Serialized as the JSON sidecar next to the payload; unknown fields are
/// ignored by readers so the schema can grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object key
    pub key: String,

    /// Payload size in bytes
    pub size: u64,

    /// MIME content type
    #[serde(default)]
    pub content_type: String,

    /// Hex-encoded SHA-256 of the payload
    #[serde(default)]
    pub hash: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,

    /// Last access timestamp
    pub accessed_at: DateTime<Utc>,

    /// Object version, bumped on every overwrite
    #[serde(default)]
    pub version: String,

    /// Open user-defined attributes
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl ObjectMetadata {
    /// Create a fresh metadata record for a key.
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            size: 0,
            content_type: String::new(),
            hash: String::new(),
            created_at: now,
            updated_at: now,
            accessed_at: now,
            version: "1".to_string(),
            attributes: HashMap::new(),
        }
    }

    /// Bump the version counter, falling back to "1" for non-numeric versions.
    pub fn bump_version(&mut self) {
        self.version = match self.version.parse::<u64>() {
            Ok(v) => (v + 1).to_string(),
            Err(_) => "1".to_string(),
        };
    }
}

/// Status of a node within the cluster lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node is joining the cluster
    Joining,

    /// Node is active and serving
    Active,

    /// Node is draining before departure
    Draining,

    /// Node is leaving the cluster
    Leaving,

    /// Node failed the failure detector
    Failed,
}

/// Health classification for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealthState {
    /// Responding within thresholds
    Healthy,

    /// Responding slowly
    Degraded,

    /// Failing probes
    Unhealthy,

    /// Not responding at all
    Down,
}

impl NodeHealthState {
    /// Placement score contribution for this health state.
    pub fn score(&self) -> f64 {
        match self {
            NodeHealthState::Healthy => 100.0,
            NodeHealthState::Degraded => 50.0,
            NodeHealthState::Unhealthy | NodeHealthState::Down => 0.0,
        }
    }
}

/// Outcome classification for a health sub-check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Check passed
    Ok,

    /// Check passed with concerns
    Warning,

    /// Check failed
    Error,
}

impl CheckStatus {
    /// The worse of two statuses.
    pub fn combine(self, other: CheckStatus) -> CheckStatus {
        use CheckStatus::*;
        match (self, other) {
            (Error, _) | (_, Error) => Error,
            (Warning, _) | (_, Warning) => Warning,
            _ => Ok,
        }
    }
}

/// Capacity bookkeeping for a node
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Total bytes of storage
    pub total: u64,

    /// Bytes in use
    pub used: u64,

    /// Bytes available
    pub available: u64,
}

impl NodeCapacity {
    /// Fraction of capacity still available, in [0, 1].
    pub fn available_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.available as f64 / self.total as f64
    }
}

/// Probe-derived health record for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Current health classification
    pub status: NodeHealthState,

    /// When the last probe ran
    pub last_check: DateTime<Utc>,

    /// Last probe round-trip in milliseconds
    pub response_time_ms: u64,

    /// Fraction of recent probes that succeeded, in [0, 1]
    pub success_rate: f64,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            status: NodeHealthState::Healthy,
            last_check: Utc::now(),
            response_time_ms: 0,
            success_rate: 1.0,
        }
    }
}

/// Membership record for a storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNode {
    /// Node ID
    pub id: NodeId,

    /// Node address (host:port or URL, opaque to the core)
    pub address: String,

    /// Geographic region
    pub region: RegionId,

    /// Availability zone within the region
    #[serde(default)]
    pub zone: String,

    /// Capacity bookkeeping
    #[serde(default)]
    pub capacity: NodeCapacity,

    /// Probe-derived health
    pub health: NodeHealth,

    /// Load factor in [0, 1]; higher means busier
    #[serde(default)]
    pub load_factor: f64,

    /// Last time the node was seen alive
    pub last_seen: DateTime<Utc>,

    /// Consecutive probe failures
    #[serde(default)]
    pub failure_count: u32,

    /// Lifecycle status
    pub status: NodeStatus,
}

impl StorageNode {
    /// Create an active node record with default health and capacity.
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, region: impl Into<RegionId>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            region: region.into(),
            zone: String::new(),
            capacity: NodeCapacity::default(),
            health: NodeHealth::default(),
            load_factor: 0.0,
            last_seen: Utc::now(),
            failure_count: 0,
            status: NodeStatus::Active,
        }
    }

    /// Whether the node is usable as a replication target.
    pub fn is_available(&self) -> bool {
        self.status != NodeStatus::Failed
            && matches!(
                self.health.status,
                NodeHealthState::Healthy | NodeHealthState::Degraded
            )
    }
}

/// Consistency guarantee requested for replicated writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// All selected targets must acknowledge before the write returns
    Strong,

    /// At least one target must acknowledge; the rest converge later
    Eventual,

    /// Fire-and-forget
    Weak,
}

/// Replication placement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStrategyKind {
    /// Replicate immediately to the best-scoring nodes
    Eager,

    /// Replicate only objects that have aged past the lazy threshold
    Lazy,

    /// Spread one replica per distinct region
    Geographic,
}

/// Replication policy attached to a key (or inherited as the default)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// Minimum peer replicas required
    pub min_replicas: usize,

    /// Maximum peer replicas maintained
    pub max_replicas: usize,

    /// Nodes to favor during target selection
    #[serde(default)]
    pub preferred_nodes: Vec<NodeId>,

    /// Nodes that must never hold a replica
    #[serde(default)]
    pub excluded_nodes: Vec<NodeId>,

    /// Requested consistency level
    pub consistency_level: ConsistencyLevel,

    /// Placement strategy
    pub strategy: ReplicationStrategyKind,

    /// Scheduling priority; higher runs sooner
    #[serde(default)]
    pub priority: i32,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 3,
            preferred_nodes: Vec::new(),
            excluded_nodes: Vec::new(),
            consistency_level: ConsistencyLevel::Eventual,
            strategy: ReplicationStrategyKind::Eager,
            priority: 0,
        }
    }
}

/// Synchronization state of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Replication not yet attempted
    Pending,

    /// Replication in flight
    InProgress,

    /// Replica confirmed up to date
    Synced,

    /// Replication failed terminally
    Failed,
}

/// Per-key replica health, maintained exclusively by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Object key
    pub key: String,

    /// Nodes holding (or assigned) a replica, local node included
    pub replica_nodes: Vec<NodeId>,

    /// Number of replicas currently assigned
    pub current_count: usize,

    /// Number of replicas confirmed in sync
    pub healthy_count: usize,

    /// Sync state per node
    pub per_node_sync_state: HashMap<NodeId, SyncState>,

    /// Completion time of the last sync pass
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl ReplicationStatus {
    /// Create a status record with every node pending.
    pub fn new(key: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        let per_node_sync_state = nodes
            .iter()
            .map(|n| (n.clone(), SyncState::Pending))
            .collect();
        let current_count = nodes.len();
        Self {
            key: key.into(),
            replica_nodes: nodes,
            current_count,
            healthy_count: 0,
            per_node_sync_state,
            last_sync_time: None,
        }
    }

    /// Recompute the derived counters from the per-node states.
    pub fn recount(&mut self) {
        self.current_count = self.replica_nodes.len();
        self.healthy_count = self
            .per_node_sync_state
            .values()
            .filter(|s| **s == SyncState::Synced)
            .count();
    }
}

/// Kind of replication work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Push a new replica to targets
    Replicate,

    /// Re-push an existing object to lagging targets
    Sync,

    /// Re-hash remote copies against local metadata
    Verify,

    /// Remove replicas from targets
    Remove,
}

/// Lifecycle state of a replication operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Queued, not yet picked up by a worker
    Pending,

    /// A worker owns it
    InProgress,

    /// All required targets acknowledged
    Completed,

    /// Terminally failed (or cancelled)
    Failed,
}

/// Tracked record of one replication operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Operation ID
    pub id: String,

    /// Kind of work
    pub kind: OperationKind,

    /// Object key
    pub key: String,

    /// Originating node
    pub source: NodeId,

    /// Target nodes in dispatch order
    pub targets: Vec<NodeId>,

    /// Lifecycle state
    pub state: OperationState,

    /// Completed fraction in [0, 1]
    pub progress: f64,

    /// Retries consumed across all targets
    pub retry_count: u32,

    /// When a worker picked the operation up
    pub started_at: Option<DateTime<Utc>>,

    /// When the operation reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Aggregated error message, if any target failed terminally
    pub error: Option<String>,
}

impl Operation {
    /// Create a pending operation record.
    pub fn new(kind: OperationKind, key: impl Into<String>, source: NodeId, targets: Vec<NodeId>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            key: key.into(),
            source,
            targets,
            state: OperationState::Pending,
            progress: 0.0,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Whether the operation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, OperationState::Completed | OperationState::Failed)
    }
}

/// Sort field for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    /// Sort by key
    Name,

    /// Sort by payload size
    Size,

    /// Sort by `updated_at`
    Modified,
}

/// Listing request options
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Key prefix filter
    pub prefix: String,

    /// Maximum entries returned; 0 means unlimited
    pub limit: usize,

    /// Sort field; defaults to key order
    pub sort: Option<SortField>,

    /// Sort descending instead of ascending
    pub descending: bool,

    /// Opaque continuation token from a previous truncated listing
    pub continuation: Option<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            limit: 0,
            sort: None,
            descending: false,
            continuation: None,
        }
    }
}

impl ListOptions {
    /// Listing of everything under a prefix, key order.
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }
}

/// Listing result page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    /// Metadata for the returned page
    pub objects: Vec<ObjectMetadata>,

    /// Total matches before pagination
    pub total: usize,

    /// Token resuming after this page, when truncated
    pub next_continuation: Option<String>,
}

/// Local storage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    /// Number of stored objects
    pub total_objects: u64,

    /// Total payload bytes
    pub total_bytes: u64,

    /// Write operations served
    pub writes: u64,

    /// Read operations served
    pub reads: u64,

    /// Delete operations served
    pub deletes: u64,

    /// Operations that returned an error
    pub errors: u64,

    /// Metadata cache hit rate in [0, 1]
    pub cache_hit_rate: f64,

    /// Timestamp of this snapshot
    pub last_updated: DateTime<Utc>,
}

/// Result of a single health sub-check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Outcome of the check
    pub status: CheckStatus,

    /// Human-readable detail
    pub message: String,
}

impl HealthCheckResult {
    /// Passing check with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Ok,
            message: message.into(),
        }
    }

    /// Warning check with a message.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warning,
            message: message.into(),
        }
    }

    /// Failing check with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            message: message.into(),
        }
    }
}

/// Aggregate health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all sub-checks
    pub status: CheckStatus,

    /// Individual sub-checks by name
    pub checks: HashMap<String, HealthCheckResult>,

    /// When the report was generated
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report from named sub-checks, deriving the overall status.
    pub fn from_checks(checks: HashMap<String, HealthCheckResult>) -> Self {
        let status = checks
            .values()
            .fold(CheckStatus::Ok, |acc, c| acc.combine(c.status));
        Self {
            status,
            checks,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_bumps_numerically() {
        let mut meta = ObjectMetadata::new("k");
        assert_eq!(meta.version, "1");
        meta.bump_version();
        assert_eq!(meta.version, "2");
        meta.version = "not-a-number".to_string();
        meta.bump_version();
        assert_eq!(meta.version, "1");
    }

    #[test]
    fn replication_status_recount() {
        let mut status = ReplicationStatus::new(
            "k",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        );
        assert_eq!(status.current_count, 3);
        assert_eq!(status.healthy_count, 0);

        status
            .per_node_sync_state
            .insert("a".to_string(), SyncState::Synced);
        status
            .per_node_sync_state
            .insert("b".to_string(), SyncState::Failed);
        status.recount();
        assert_eq!(status.healthy_count, 1);
    }

    #[test]
    fn check_status_combines_to_worst() {
        assert_eq!(
            CheckStatus::Ok.combine(CheckStatus::Warning),
            CheckStatus::Warning
        );
        assert_eq!(
            CheckStatus::Warning.combine(CheckStatus::Error),
            CheckStatus::Error
        );
        assert_eq!(CheckStatus::Ok.combine(CheckStatus::Ok), CheckStatus::Ok);
    }

    #[test]
    fn node_availability_tracks_health_and_status() {
        let mut node = StorageNode::new("n1", "127.0.0.1:7000", "us-east");
        assert!(node.is_available());

        node.health.status = NodeHealthState::Degraded;
        assert!(node.is_available());

        node.health.status = NodeHealthState::Down;
        assert!(!node.is_available());

        node.health.status = NodeHealthState::Healthy;
        node.status = NodeStatus::Failed;
        assert!(!node.is_available());
    }

    #[test]
    fn sidecar_readers_ignore_unknown_fields() {
        let json = r#"{
            "key": "docs/1",
            "size": 5,
            "content_type": "text/plain",
            "hash": "abc",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "accessed_at": "2024-01-01T00:00:00Z",
            "version": "1",
            "attributes": {},
            "future_field": true
        }"#;
        let meta: ObjectMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.key, "docs/1");
        assert_eq!(meta.size, 5);
    }
}
