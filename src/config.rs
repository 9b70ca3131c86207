// Configuration types for the object storage node
//
// Plain serde structs with defaults. Reading these from a file or the
// environment is the embedding application's responsibility.

use crate::types::{ConsistencyLevel, ReplicationStrategyKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackendKind {
    /// Embedded key-value database
    EmbeddedKv,

    /// One sidecar file per key under the metadata directory
    Filesystem,

    /// Volatile in-memory map
    Memory,
}

/// How secondary indexes are maintained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingMode {
    /// Build default indexes at startup
    Eager,

    /// Register default indexes but defer building until first use
    Lazy,

    /// No default indexes
    Disabled,
}

/// Metadata layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Which backend persists metadata records
    #[serde(default = "default_backend")]
    pub backend: MetadataBackendKind,
}

fn default_backend() -> MetadataBackendKind {
    MetadataBackendKind::Filesystem
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Strategy used when a key has no explicit policy
    pub default_strategy: ReplicationStrategyKind,

    /// Minimum peer replicas required by the default policy
    pub min_replicas: usize,

    /// Maximum peer replicas maintained by the default policy
    pub max_replicas: usize,

    /// Consistency level of the default policy
    pub consistency_level: ConsistencyLevel,

    /// Worker pool size per coordinator queue
    pub max_concurrent_syncs: usize,

    /// Per-request timeout for peer calls, in milliseconds
    pub sync_timeout_ms: u64,

    /// Retry budget per target
    pub retry_attempts: u32,

    /// Base retry delay, doubled per attempt, in milliseconds
    pub retry_delay_ms: u64,

    /// Interval of the replica health re-evaluation, in milliseconds
    pub health_check_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            default_strategy: ReplicationStrategyKind::Eager,
            min_replicas: 1,
            max_replicas: 3,
            consistency_level: ConsistencyLevel::Eventual,
            max_concurrent_syncs: 4,
            sync_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 500,
            health_check_interval_ms: 60_000,
        }
    }
}

/// Membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Interval between health probe rounds, in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Silence after which a node is declared failed, in milliseconds
    pub failure_timeout_ms: u64,

    /// Consecutive probe failures before a node is marked unhealthy
    pub max_failures: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            failure_timeout_ms: 30_000,
            max_failures: 3,
        }
    }
}

/// Top-level storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNodeConfig {
    /// Root of the on-disk layout
    pub base_path: PathBuf,

    /// Maximum payload size in bytes; 0 means unlimited
    #[serde(default)]
    pub max_size: u64,

    /// Entries held by the metadata cache
    #[serde(default = "default_cache_size")]
    pub max_cache_size: usize,

    /// Metadata layer configuration
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Membership configuration
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Secondary index maintenance mode
    #[serde(default = "default_indexing_mode")]
    pub indexing_mode: IndexingMode,
}

fn default_cache_size() -> usize {
    10_000
}

fn default_indexing_mode() -> IndexingMode {
    IndexingMode::Eager
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
            max_size: 0,
            max_cache_size: default_cache_size(),
            metadata: MetadataConfig::default(),
            replication: ReplicationConfig::default(),
            membership: MembershipConfig::default(),
            indexing_mode: default_indexing_mode(),
        }
    }
}
