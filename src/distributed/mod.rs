// Distributed storage façade
//
// Composes the local blob store, cluster membership, lock registry, and
// replication coordinator behind one `DistributedStorage` API. Reads serve
// locally and fall back to replicas; writes land locally and replicate
// according to the key's effective policy.

use crate::config::StorageNodeConfig;
use crate::cluster::ClusterManager;
use crate::coordination::{ConsensusOracle, ConsensusState, LockHandle, LockRegistry};
use crate::error::{Result, StorageNodeError};
use crate::replication::{
    LocalObjectSource, PeerTransport, ReplicationCoordinator,
};
use crate::replication::policy::validate_policy;
use crate::storage::{BatchItem, BlobStore, ObjectReader, Storage};
use crate::types::{
    CheckStatus, ConsistencyLevel, HealthCheckResult, HealthReport, ListOptions, ListResult,
    NodeId, ObjectMetadata, Operation, OperationKind, ReplicationPolicy, ReplicationStatus,
    StorageNode, StorageStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Distributed node metrics
pub mod metrics;

pub use metrics::{DistributedMetrics, LatencySummary, MetricsRegistry};

/// Full distributed storage API, a superset of `Storage`.
#[async_trait]
pub trait DistributedStorage: Storage {
    /// Replicate a key to explicit targets and wait for the outcome.
    async fn replicate(&self, key: &str, targets: &[NodeId]) -> Result<Operation>;

    /// Replication status tracked for a key.
    async fn get_replication_status(&self, key: &str) -> Result<ReplicationStatus>;

    /// Attach a policy to a key and re-evaluate its replica set.
    async fn set_replication_policy(&self, key: &str, policy: ReplicationPolicy) -> Result<()>;

    /// Consensus-guarded write.
    async fn propose_write(
        &self,
        key: &str,
        payload: Bytes,
        metadata: Option<ObjectMetadata>,
    ) -> Result<ObjectMetadata>;

    /// Consensus-guarded delete.
    async fn propose_delete(&self, key: &str) -> Result<()>;

    /// Register a cluster node.
    async fn add_node(&self, node: StorageNode) -> Result<()>;

    /// Remove a cluster node.
    async fn remove_node(&self, node_id: &str) -> Result<()>;

    /// All known cluster nodes.
    async fn get_nodes(&self) -> Result<Vec<StorageNode>>;

    /// Acquire a named distributed lock.
    async fn acquire_lock(&self, lock_id: &str, ttl: Duration) -> Result<LockHandle>;

    /// Current consensus state as reported by the oracle.
    async fn get_consensus_state(&self) -> Result<ConsensusState>;

    /// Aggregated metrics snapshot.
    async fn get_distributed_metrics(&self) -> Result<DistributedMetrics>;
}

/// Distributed storage node façade
pub struct DistributedStore {
    config: StorageNodeConfig,
    local: Arc<BlobStore>,
    cluster: Arc<ClusterManager>,
    locks: Arc<LockRegistry>,
    coordinator: Arc<ReplicationCoordinator>,
    transport: Arc<dyn PeerTransport>,
    oracle: Option<Arc<dyn ConsensusOracle>>,
    policies: DashMap<String, ReplicationPolicy>,
    default_policy: ReplicationPolicy,
    metrics: Arc<MetricsRegistry>,
    weak_self: Weak<DistributedStore>,
}

impl DistributedStore {
    pub fn new(
        config: StorageNodeConfig,
        local_node: StorageNode,
        local: Arc<BlobStore>,
        transport: Arc<dyn PeerTransport>,
        oracle: Option<Arc<dyn ConsensusOracle>>,
    ) -> Arc<Self> {
        let cluster = ClusterManager::new(
            local_node.clone(),
            config.membership.clone(),
            Arc::clone(&transport),
        );
        let coordinator = ReplicationCoordinator::new(
            local_node.id.clone(),
            config.replication.clone(),
            Arc::clone(&transport),
            Arc::clone(&local) as Arc<dyn LocalObjectSource>,
        );
        let default_policy = ReplicationPolicy {
            min_replicas: config.replication.min_replicas,
            max_replicas: config.replication.max_replicas,
            consistency_level: config.replication.consistency_level,
            strategy: config.replication.default_strategy,
            ..Default::default()
        };
        let locks = Arc::new(LockRegistry::new(local_node.id.clone()));
        Arc::new_cyclic(|weak| Self {
            config,
            local,
            cluster,
            locks,
            coordinator,
            transport,
            oracle,
            policies: DashMap::new(),
            default_policy,
            metrics: Arc::new(MetricsRegistry::new()),
            weak_self: weak.clone(),
        })
    }

    /// Id of the local node.
    pub fn node_id(&self) -> &NodeId {
        &self.cluster.local_node().id
    }

    /// The local blob store under this façade.
    pub fn local_store(&self) -> Arc<BlobStore> {
        Arc::clone(&self.local)
    }

    /// The cluster membership manager.
    pub fn cluster(&self) -> Arc<ClusterManager> {
        Arc::clone(&self.cluster)
    }

    /// The replication coordinator.
    pub fn coordinator(&self) -> Arc<ReplicationCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// The policy in effect for a key (its own, or the configured default).
    pub fn effective_policy(&self, key: &str) -> ReplicationPolicy {
        self.policies
            .get(key)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.default_policy.clone())
    }

    fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.config.replication.sync_timeout_ms)
    }

    /// Gate proposals through the consensus oracle.
    ///
    /// With a healthy oracle only the leader accepts proposals; without one
    /// (or with an unhealthy one) the direct local path applies.
    fn consensus_gate(&self) -> Result<()> {
        let Some(oracle) = &self.oracle else {
            return Ok(());
        };
        let state = oracle.state();
        if !state.is_healthy {
            debug!("consensus unhealthy, falling back to direct local write");
            return Ok(());
        }
        match state.leader_id {
            Some(ref leader) if leader == self.node_id() => Ok(()),
            Some(leader) => Err(StorageNodeError::Unavailable(format!(
                "not the consensus leader; propose through {leader}"
            ))),
            None => Err(StorageNodeError::Unavailable(
                "consensus reports healthy but no leader is elected".to_string(),
            )),
        }
    }

    /// Pick replication targets for a write under `policy`.
    async fn select_targets(&self, policy: &ReplicationPolicy) -> Vec<StorageNode> {
        let candidates = self.cluster.get_healthy().await;
        policy
            .strategy
            .select_targets(self.node_id(), &candidates, policy)
    }

    async fn replicate_after_write(
        &self,
        key: &str,
        payload: Bytes,
        metadata: &ObjectMetadata,
        policy: &ReplicationPolicy,
        targets: Vec<StorageNode>,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let submit = self
            .coordinator
            .submit(
                OperationKind::Replicate,
                key,
                targets,
                Some(payload),
                Some(metadata.clone()),
                policy.clone(),
                None,
            )
            .await;
        match policy.consistency_level {
            ConsistencyLevel::Strong => {
                let op = submit?.wait().await?;
                if op.state != crate::types::OperationState::Completed {
                    return Err(StorageNodeError::Consistency(format!(
                        "strong replication of {key} failed: {}",
                        op.error.unwrap_or_else(|| "unknown".to_string())
                    )));
                }
                Ok(())
            }
            _ => {
                // The caller is not failed once the write is durable
                // locally; a queue rejection just defers convergence.
                if let Err(e) = submit {
                    warn!("queuing replication for {} failed: {}", key, e);
                    self.metrics.record_failure();
                }
                Ok(())
            }
        }
    }

    async fn retrieve_from_replicas(&self, key: &str) -> Result<(ObjectReader, ObjectMetadata)> {
        let Some(status) = self.coordinator.get_status(key) else {
            return Err(StorageNodeError::NotFound(format!("object {key}")));
        };
        let timeout = self.peer_timeout();
        for node_id in &status.replica_nodes {
            if node_id == self.node_id() {
                continue;
            }
            let Some(node) = self.cluster.get_node(node_id).await else {
                continue;
            };
            match tokio::time::timeout(timeout, self.transport.retrieve(&node, key, timeout)).await
            {
                Ok(Ok((bytes, metadata))) => {
                    debug!("served {} from replica {}", key, node_id);
                    // Keep a local copy so the next read is local.
                    if let Err(e) = self
                        .local
                        .store(key, bytes.clone(), Some(metadata.clone()))
                        .await
                    {
                        warn!("caching replica of {} locally failed: {}", key, e);
                    }
                    self.metrics.record_retrieve(bytes.len() as u64);
                    return Ok((ObjectReader::from_bytes(bytes), metadata));
                }
                Ok(Err(e)) => debug!("replica {} miss for {}: {}", node_id, key, e),
                Err(_) => debug!("replica {} timed out for {}", node_id, key),
            }
        }
        Err(StorageNodeError::NotFound(format!("object {key}")))
    }

    /// Re-sync every replica the coordinator marked failed.
    ///
    /// Returns how many sync operations were enqueued. The background
    /// repair loop calls this on the replication health-check interval.
    pub async fn repair_failed_replicas(&self) -> usize {
        let mut enqueued = 0;
        for (key, node_ids) in self.coordinator.failed_replicas() {
            let policy = self.effective_policy(&key);
            let mut targets = Vec::new();
            for id in node_ids {
                if let Some(node) = self.cluster.get_node(&id).await {
                    if node.is_available() {
                        targets.push(node);
                    }
                }
            }
            if targets.is_empty() {
                continue;
            }
            match self
                .coordinator
                .submit(
                    OperationKind::Sync,
                    &key,
                    targets,
                    None,
                    None,
                    policy,
                    Some(Duration::from_millis(100)),
                )
                .await
            {
                Ok(_) => enqueued += 1,
                Err(e) => warn!("queuing replica repair for {} failed: {}", key, e),
            }
        }
        enqueued
    }

    fn spawn_replica_repair(&self) {
        let Some(store) = self.weak_self.upgrade() else {
            return;
        };
        let mut shutdown = self.coordinator.shutdown_signal();
        let interval_ms = self.config.replication.health_check_interval_ms.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let repaired = store.repair_failed_replicas().await;
                        if repaired > 0 {
                            debug!("replica repair enqueued {} sync operations", repaired);
                        }
                    }
                }
            }
        });
    }

    async fn remove_replicas(&self, key: &str, policy: &ReplicationPolicy) -> Result<()> {
        let Some(status) = self.coordinator.get_status(key) else {
            return Ok(());
        };
        let mut targets = Vec::new();
        for node_id in &status.replica_nodes {
            if node_id == self.node_id() {
                continue;
            }
            if let Some(node) = self.cluster.get_node(node_id).await {
                targets.push(node);
            }
        }
        if targets.is_empty() {
            return Ok(());
        }
        let submit = self
            .coordinator
            .submit(
                OperationKind::Remove,
                key,
                targets,
                None,
                None,
                policy.clone(),
                None,
            )
            .await;
        match policy.consistency_level {
            ConsistencyLevel::Strong => {
                let op = submit?.wait().await?;
                if op.state != crate::types::OperationState::Completed {
                    return Err(StorageNodeError::Consistency(format!(
                        "replica deletion of {key} failed: {}",
                        op.error.unwrap_or_else(|| "unknown".to_string())
                    )));
                }
            }
            _ => {
                // Best effort under eventual/weak consistency.
                if let Err(e) = submit {
                    warn!("queuing replica deletion for {} failed: {}", key, e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for DistributedStore {
    async fn store(
        &self,
        key: &str,
        payload: Bytes,
        metadata: Option<ObjectMetadata>,
    ) -> Result<ObjectMetadata> {
        let started = Instant::now();
        let policy = self.effective_policy(key);

        // Strong consistency needs its quorum before anything is written.
        let preselected = if policy.consistency_level == ConsistencyLevel::Strong {
            let targets = self.select_targets(&policy).await;
            if targets.len() < policy.min_replicas {
                self.metrics.record_failure();
                return Err(StorageNodeError::Unavailable(format!(
                    "strong consistency requires {} healthy peers, found {}",
                    policy.min_replicas,
                    targets.len()
                )));
            }
            Some(targets)
        } else {
            None
        };

        let stored = self.local.store(key, payload.clone(), metadata).await?;
        self.metrics.record_store(stored.size);

        if policy.strategy.should_replicate(&stored, &policy) {
            let targets = match preselected {
                Some(targets) => targets,
                None => self.select_targets(&policy).await,
            };
            self.replicate_after_write(key, payload, &stored, &policy, targets)
                .await?;
        }
        self.metrics.record_latency(started.elapsed());
        Ok(stored)
    }

    async fn retrieve(&self, key: &str) -> Result<(ObjectReader, ObjectMetadata)> {
        let started = Instant::now();
        let result = match self.local.retrieve(key).await {
            Ok((reader, metadata)) => {
                self.metrics.record_retrieve(metadata.size);
                Ok((reader, metadata))
            }
            Err(StorageNodeError::NotFound(_)) => self.retrieve_from_replicas(key).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.metrics.record_failure();
        }
        self.metrics.record_latency(started.elapsed());
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let policy = self.effective_policy(key);
        self.local.delete(key).await?;
        self.remove_replicas(key, &policy).await?;
        self.coordinator.remove_status(key);
        self.metrics.record_delete();
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.local.exists(key).await? {
            return Ok(true);
        }
        let Some(status) = self.coordinator.get_status(key) else {
            return Ok(false);
        };
        let timeout = self.peer_timeout();
        for node_id in &status.replica_nodes {
            if node_id == self.node_id() {
                continue;
            }
            let Some(node) = self.cluster.get_node(node_id).await else {
                continue;
            };
            if let Ok(Ok(_)) =
                tokio::time::timeout(timeout, self.transport.retrieve(&node, key, timeout)).await
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata> {
        self.local.get_metadata(key).await
    }

    async fn set_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<ObjectMetadata> {
        self.local.set_metadata(key, metadata).await
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
        self.local.list(options).await
    }

    async fn list_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.local.list_keys(prefix, limit).await
    }

    async fn health_check(&self) -> Result<HealthReport> {
        let local_report = self.local.health_check().await?;
        let mut checks = local_report.checks;

        let consensus_check = match &self.oracle {
            None => HealthCheckResult::ok("no consensus oracle configured"),
            Some(oracle) => {
                if oracle.state().is_healthy {
                    HealthCheckResult::ok("consensus healthy")
                } else {
                    HealthCheckResult::error("consensus oracle reports unhealthy")
                }
            }
        };
        checks.insert("consensus".to_string(), consensus_check);

        let connectivity = self.cluster.connectivity_fraction().await;
        let connectivity_check = HealthCheckResult {
            status: if connectivity >= 0.8 {
                CheckStatus::Ok
            } else if connectivity >= 0.5 {
                CheckStatus::Warning
            } else {
                CheckStatus::Error
            },
            message: format!("{:.0}% of known nodes reachable", connectivity * 100.0),
        };
        checks.insert("connectivity".to_string(), connectivity_check);

        let replica_health = self.coordinator.replica_health_fraction();
        let replication_check = HealthCheckResult {
            status: if replica_health >= 0.9 {
                CheckStatus::Ok
            } else {
                CheckStatus::Warning
            },
            message: format!("{:.0}% of tracked replicas healthy", replica_health * 100.0),
        };
        checks.insert("replication".to_string(), replication_check);

        Ok(HealthReport::from_checks(checks))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        self.local.get_stats().await
    }

    async fn start(&self) -> Result<()> {
        self.local.start().await?;
        self.cluster.start();
        self.coordinator.start();
        self.spawn_replica_repair();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.coordinator.stop();
        self.cluster.stop();
        self.local.stop().await
    }
}

#[async_trait]
impl DistributedStorage for DistributedStore {
    async fn replicate(&self, key: &str, targets: &[NodeId]) -> Result<Operation> {
        if !self.local.exists(key).await? {
            return Err(StorageNodeError::NotFound(format!("object {key}")));
        }
        let mut nodes = Vec::with_capacity(targets.len());
        for id in targets {
            let node = self
                .cluster
                .get_node(id)
                .await
                .ok_or_else(|| StorageNodeError::NotFound(format!("node {id}")))?;
            nodes.push(node);
        }
        let policy = self.effective_policy(key);
        let handle = self
            .coordinator
            .submit(
                OperationKind::Replicate,
                key,
                nodes,
                None,
                None,
                policy,
                None,
            )
            .await?;
        handle.wait().await
    }

    async fn get_replication_status(&self, key: &str) -> Result<ReplicationStatus> {
        self.coordinator
            .get_status(key)
            .ok_or_else(|| StorageNodeError::NotFound(format!("replication status for {key}")))
    }

    async fn set_replication_policy(&self, key: &str, policy: ReplicationPolicy) -> Result<()> {
        validate_policy(&policy)?;
        self.policies.insert(key.to_string(), policy.clone());
        // Bring the replica set into conformance with the new policy.
        let cluster_nodes = self.cluster.get_healthy().await;
        let handles = self
            .coordinator
            .apply_policy(key, &policy, &cluster_nodes)
            .await?;
        debug!(
            "policy update for {} enqueued {} conformance operations",
            key,
            handles.len()
        );
        Ok(())
    }

    async fn propose_write(
        &self,
        key: &str,
        payload: Bytes,
        metadata: Option<ObjectMetadata>,
    ) -> Result<ObjectMetadata> {
        self.consensus_gate()?;
        self.store(key, payload, metadata).await
    }

    async fn propose_delete(&self, key: &str) -> Result<()> {
        self.consensus_gate()?;
        self.delete(key).await
    }

    async fn add_node(&self, node: StorageNode) -> Result<()> {
        self.cluster.add_node(node).await;
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.cluster.remove_node(node_id).await
    }

    async fn get_nodes(&self) -> Result<Vec<StorageNode>> {
        Ok(self.cluster.get_all().await)
    }

    async fn acquire_lock(&self, lock_id: &str, ttl: Duration) -> Result<LockHandle> {
        self.locks.acquire(lock_id, ttl)
    }

    async fn get_consensus_state(&self) -> Result<ConsensusState> {
        Ok(self
            .oracle
            .as_ref()
            .map(|o| o.state())
            .unwrap_or_default())
    }

    async fn get_distributed_metrics(&self) -> Result<DistributedMetrics> {
        let cluster_size = self.cluster.len().await;
        let healthy = self.cluster.get_healthy().await.len();
        Ok(self.metrics.snapshot(
            self.local.metadata_cache().hit_rate(),
            cluster_size,
            healthy,
            self.coordinator.average_replica_count(),
        ))
    }
}
