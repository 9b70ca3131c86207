// Cluster membership manager
//
// Maintains the registry of known storage nodes, probes them on the
// heartbeat interval, sweeps for silent failures, and selects nodes for
// placement. Selection is deterministic: every strategy breaks ties on
// node id.

use crate::config::MembershipConfig;
use crate::error::{Result, StorageNodeError};
use crate::replication::transport::PeerTransport;
use crate::types::{NodeHealthState, NodeId, NodeStatus, StorageNode};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Probes slower than this mark a node degraded.
const DEGRADED_RESPONSE_MS: u64 = 500;

/// EWMA weight of the newest probe outcome in the success rate.
const SUCCESS_RATE_ALPHA: f64 = 0.2;

/// Node selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Least loaded nodes first
    LoadBalanced,

    /// Most free capacity first
    CapacityBased,

    /// One node per distinct region
    Geographic,
}

/// Constraints narrowing a selection
#[derive(Debug, Clone, Default)]
pub struct SelectionConstraints {
    /// Nodes that must not be selected
    pub exclude: Vec<NodeId>,

    /// Nodes favored when scores tie
    pub preferred: Vec<NodeId>,

    /// Restrict selection to one region
    pub region: Option<String>,
}

/// Membership registry with background health checking
pub struct ClusterManager {
    local_node: StorageNode,
    config: MembershipConfig,
    nodes: Arc<RwLock<HashMap<NodeId, StorageNode>>>,
    transport: Arc<dyn PeerTransport>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl ClusterManager {
    pub fn new(
        local_node: StorageNode,
        config: MembershipConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            local_node,
            config,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            transport,
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// The node this manager runs on.
    pub fn local_node(&self) -> &StorageNode {
        &self.local_node
    }

    /// Register a node; a second add for the same id replaces the record.
    pub async fn add_node(&self, node: StorageNode) {
        info!("registering node {} at {}", node.id, node.address);
        self.nodes.write().await.insert(node.id.clone(), node);
    }

    /// Remove a node from the registry.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.nodes
            .write()
            .await
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| StorageNodeError::NotFound(format!("node {node_id}")))
    }

    /// Look up one node.
    pub async fn get_node(&self, node_id: &str) -> Option<StorageNode> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// All known nodes, id order.
    pub async fn get_all(&self) -> Vec<StorageNode> {
        let mut nodes: Vec<StorageNode> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Nodes usable as replication targets, id order.
    ///
    /// Failed nodes and nodes with unhealthy/down health are excluded.
    pub async fn get_healthy(&self) -> Vec<StorageNode> {
        let mut nodes: Vec<StorageNode> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_available())
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Number of known nodes.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Fraction of known nodes seen alive within the failure timeout.
    pub async fn connectivity_fraction(&self) -> f64 {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return 1.0;
        }
        let timeout = chrono::Duration::milliseconds(self.config.failure_timeout_ms as i64);
        let now = Utc::now();
        let connected = nodes
            .values()
            .filter(|n| now - n.last_seen < timeout)
            .count();
        connected as f64 / nodes.len() as f64
    }

    /// Select up to `count` nodes by strategy, honoring the constraints.
    pub async fn select_nodes(
        &self,
        strategy: SelectionStrategy,
        count: usize,
        constraints: &SelectionConstraints,
    ) -> Vec<StorageNode> {
        let nodes = self.nodes.read().await;
        let mut eligible: Vec<StorageNode> = nodes
            .values()
            .filter(|n| n.is_available())
            .filter(|n| !constraints.exclude.contains(&n.id))
            .filter(|n| {
                constraints
                    .region
                    .as_deref()
                    .map(|r| n.region == r)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        drop(nodes);

        match strategy {
            SelectionStrategy::LoadBalanced => {
                eligible.sort_by(|a, b| {
                    a.load_factor
                        .partial_cmp(&b.load_factor)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                eligible.truncate(count);
                eligible
            }
            SelectionStrategy::CapacityBased => {
                eligible.sort_by(|a, b| {
                    b.capacity
                        .available
                        .cmp(&a.capacity.available)
                        .then_with(|| a.id.cmp(&b.id))
                });
                eligible.truncate(count);
                eligible
            }
            SelectionStrategy::Geographic => {
                Self::select_geographic(eligible, count, constraints)
            }
        }
    }

    /// One best node per distinct region, wrapping around until `count`.
    fn select_geographic(
        eligible: Vec<StorageNode>,
        count: usize,
        constraints: &SelectionConstraints,
    ) -> Vec<StorageNode> {
        let score = |n: &StorageNode| {
            let mut s = n.health.status.score();
            if constraints.preferred.contains(&n.id) {
                s += 25.0;
            }
            s
        };

        let mut by_region: HashMap<String, Vec<StorageNode>> = HashMap::new();
        for node in eligible {
            by_region.entry(node.region.clone()).or_default().push(node);
        }
        for nodes in by_region.values_mut() {
            nodes.sort_by(|a, b| {
                score(b)
                    .partial_cmp(&score(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        // Regions ordered by their best node's score, then name.
        let mut regions: Vec<String> = by_region.keys().cloned().collect();
        regions.sort_by(|a, b| {
            let sa = by_region[a].first().map(&score).unwrap_or(0.0);
            let sb = by_region[b].first().map(&score).unwrap_or(0.0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });

        let mut selected = Vec::new();
        let mut depth = 0;
        while selected.len() < count {
            let mut any = false;
            for region in &regions {
                if selected.len() >= count {
                    break;
                }
                if let Some(node) = by_region[region].get(depth) {
                    selected.push(node.clone());
                    any = true;
                }
            }
            if !any {
                break;
            }
            depth += 1;
        }
        selected
    }

    /// Start the heartbeat prober and the failure-detector sweep.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => manager.probe_all().await,
                }
            }
            debug!("health checker stopped");
        });

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let sweep = Duration::from_millis((self.config.failure_timeout_ms / 2).max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => manager.detect_failures().await,
                }
            }
            debug!("failure detector stopped");
        });
        info!("cluster manager started for node {}", self.local_node.id);
    }

    /// Stop the background loops.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Probe every known node in parallel and fold the results in.
    async fn probe_all(&self) {
        let snapshot: Vec<StorageNode> = self.nodes.read().await.values().cloned().collect();
        if snapshot.is_empty() {
            return;
        }
        let timeout = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let probes = snapshot.iter().map(|node| {
            let transport = Arc::clone(&self.transport);
            async move {
                let result = tokio::time::timeout(timeout, transport.probe(node, timeout)).await;
                (node.id.clone(), result)
            }
        });
        let results = futures::future::join_all(probes).await;

        let mut nodes = self.nodes.write().await;
        for (id, result) in results {
            let Some(node) = nodes.get_mut(&id) else {
                continue;
            };
            node.health.last_check = Utc::now();
            match result {
                Ok(Ok(probe)) if probe.healthy => {
                    let rt_ms = probe.response_time.as_millis() as u64;
                    node.health.response_time_ms = rt_ms;
                    node.health.status = if rt_ms > DEGRADED_RESPONSE_MS {
                        NodeHealthState::Degraded
                    } else {
                        NodeHealthState::Healthy
                    };
                    node.health.success_rate =
                        node.health.success_rate * (1.0 - SUCCESS_RATE_ALPHA) + SUCCESS_RATE_ALPHA;
                    node.failure_count = 0;
                    node.last_seen = Utc::now();
                    if matches!(node.status, NodeStatus::Failed | NodeStatus::Joining) {
                        node.status = NodeStatus::Active;
                    }
                }
                _ => {
                    node.failure_count += 1;
                    node.health.success_rate *= 1.0 - SUCCESS_RATE_ALPHA;
                    if node.failure_count >= self.config.max_failures {
                        node.health.status = NodeHealthState::Unhealthy;
                    }
                    debug!(
                        "probe of {} failed ({} consecutive)",
                        node.id, node.failure_count
                    );
                }
            }
        }
    }

    /// Mark nodes silent past the failure timeout as failed.
    async fn detect_failures(&self) {
        let timeout = chrono::Duration::milliseconds(self.config.failure_timeout_ms as i64);
        let now = Utc::now();
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.status != NodeStatus::Failed && now - node.last_seen >= timeout {
                node.status = NodeStatus::Failed;
                node.health.status = NodeHealthState::Down;
                warn!(
                    "node {} declared failed after {}ms of silence",
                    node.id, self.config.failure_timeout_ms
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::transport::MemoryTransport;
    use crate::types::NodeCapacity;

    fn node(id: &str, region: &str) -> StorageNode {
        StorageNode::new(id, format!("{id}:7000"), region)
    }

    fn manager_with_transport(transport: Arc<MemoryTransport>) -> Arc<ClusterManager> {
        ClusterManager::new(
            node("local", "r1"),
            MembershipConfig::default(),
            transport as Arc<dyn PeerTransport>,
        )
    }

    fn manager() -> Arc<ClusterManager> {
        manager_with_transport(Arc::new(MemoryTransport::new()))
    }

    #[tokio::test]
    async fn add_node_twice_keeps_latest_record() {
        let manager = manager();
        manager.add_node(node("n1", "r1")).await;
        let mut updated = node("n1", "r2");
        updated.load_factor = 0.7;
        manager.add_node(updated).await;

        assert_eq!(manager.len().await, 1);
        let record = manager.get_node("n1").await.unwrap();
        assert_eq!(record.region, "r2");
        assert_eq!(record.load_factor, 0.7);
    }

    #[tokio::test]
    async fn remove_missing_node_is_not_found() {
        let manager = manager();
        manager.add_node(node("n1", "r1")).await;
        manager.remove_node("n1").await.unwrap();
        let err = manager.remove_node("n1").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn failed_nodes_are_excluded_from_healthy() {
        let manager = manager();
        manager.add_node(node("n1", "r1")).await;
        let mut failed = node("n2", "r1");
        failed.status = NodeStatus::Failed;
        manager.add_node(failed).await;

        let healthy = manager.get_healthy().await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "n1");
    }

    #[tokio::test]
    async fn load_balanced_selection_is_deterministic() {
        let manager = manager();
        for (id, load) in [("a", 0.5), ("b", 0.1), ("c", 0.5), ("d", 0.9)] {
            let mut n = node(id, "r1");
            n.load_factor = load;
            manager.add_node(n).await;
        }

        let selected = manager
            .select_nodes(
                SelectionStrategy::LoadBalanced,
                3,
                &SelectionConstraints::default(),
            )
            .await;
        let ids: Vec<&str> = selected.iter().map(|n| n.id.as_str()).collect();
        // Tie between a and c breaks on id.
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn capacity_selection_prefers_free_space() {
        let manager = manager();
        for (id, available) in [("a", 10u64), ("b", 100), ("c", 50)] {
            let mut n = node(id, "r1");
            n.capacity = NodeCapacity {
                total: 100,
                used: 100 - available,
                available,
            };
            manager.add_node(n).await;
        }

        let selected = manager
            .select_nodes(
                SelectionStrategy::CapacityBased,
                2,
                &SelectionConstraints::default(),
            )
            .await;
        let ids: Vec<&str> = selected.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn geographic_selection_spreads_regions_first() {
        let manager = manager();
        for (id, region) in [("a1", "r1"), ("a2", "r1"), ("b1", "r2"), ("c1", "r3")] {
            manager.add_node(node(id, region)).await;
        }

        let selected = manager
            .select_nodes(
                SelectionStrategy::Geographic,
                3,
                &SelectionConstraints::default(),
            )
            .await;
        assert_eq!(selected.len(), 3);
        let mut regions: Vec<&str> = selected.iter().map(|n| n.region.as_str()).collect();
        regions.sort();
        regions.dedup();
        assert_eq!(regions.len(), 3);

        // Asking for more than distinct regions wraps around.
        let four = manager
            .select_nodes(
                SelectionStrategy::Geographic,
                4,
                &SelectionConstraints::default(),
            )
            .await;
        assert_eq!(four.len(), 4);
    }

    #[tokio::test]
    async fn constraints_exclude_nodes() {
        let manager = manager();
        manager.add_node(node("a", "r1")).await;
        manager.add_node(node("b", "r1")).await;

        let selected = manager
            .select_nodes(
                SelectionStrategy::LoadBalanced,
                10,
                &SelectionConstraints {
                    exclude: vec!["a".to_string()],
                    ..Default::default()
                },
            )
            .await;
        let ids: Vec<&str> = selected.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn probe_success_resets_failures_and_updates_health() {
        let transport = Arc::new(MemoryTransport::new());
        let store = {
            use crate::metadata::{IndexEngine, MemoryBackend, MetadataCache, MetadataStore};
            let base = std::env::temp_dir().join(format!("cluster-test-{}", uuid::Uuid::new_v4()));
            let metadata = Arc::new(MetadataStore::new(Arc::new(MemoryBackend::new())));
            let cache = Arc::new(MetadataCache::new(16));
            let indexes = Arc::new(IndexEngine::new(Arc::clone(&metadata), Arc::clone(&cache)));
            Arc::new(crate::storage::BlobStore::new(base, 0, metadata, cache, indexes).unwrap())
        };
        transport.register("n1", store as Arc<dyn crate::storage::Storage>);
        let manager = manager_with_transport(transport.clone());

        let mut stale = node("n1", "r1");
        stale.failure_count = 2;
        stale.health.status = NodeHealthState::Unhealthy;
        manager.add_node(stale).await;

        manager.probe_all().await;
        let record = manager.get_node("n1").await.unwrap();
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.health.status, NodeHealthState::Healthy);

        // Now simulate an outage long enough to cross max_failures.
        transport.set_failed("n1", true);
        for _ in 0..MembershipConfig::default().max_failures {
            manager.probe_all().await;
        }
        let record = manager.get_node("n1").await.unwrap();
        assert_eq!(record.health.status, NodeHealthState::Unhealthy);
        assert!(record.failure_count >= MembershipConfig::default().max_failures);
    }

    #[tokio::test]
    async fn failure_detector_marks_silent_nodes_failed() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ClusterManager::new(
            node("local", "r1"),
            MembershipConfig {
                heartbeat_interval_ms: 1_000,
                failure_timeout_ms: 10,
                max_failures: 3,
            },
            transport as Arc<dyn PeerTransport>,
        );
        let mut silent = node("n1", "r1");
        silent.last_seen = Utc::now() - chrono::Duration::seconds(60);
        manager.add_node(silent).await;

        manager.detect_failures().await;
        let record = manager.get_node("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.health.status, NodeHealthState::Down);
        assert!(manager.get_healthy().await.is_empty());
    }
}
