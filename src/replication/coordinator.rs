// Replication coordinator
//
// Owns the bounded replication and sync queues, the worker pools draining
// them, the tracked operation records, and the per-key replication status.
// Workers push payloads to peers through the injected transport, honoring
// the policy's consistency level, with capped exponential backoff between
// retries.

use crate::config::ReplicationConfig;
use crate::error::{Result, StorageNodeError};
use crate::replication::policy::validate_policy;
use crate::replication::transport::PeerTransport;
use crate::types::{
    ConsistencyLevel, NodeId, ObjectMetadata, Operation, OperationKind, OperationState,
    ReplicationPolicy, ReplicationStatus, StorageNode, SyncState,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

const SUBMIT_WAIT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const QUEUE_CAPACITY_PER_WORKER: usize = 16;

/// Narrow read surface the coordinator has into local storage.
///
/// Workers pull payloads through this instead of holding a handle to the
/// whole façade, which keeps the dependency one-directional.
#[async_trait]
pub trait LocalObjectSource: Send + Sync {
    /// Read a locally stored object and its metadata.
    async fn read_object(&self, key: &str) -> Result<(Bytes, ObjectMetadata)>;

    /// Whether the object exists locally.
    async fn contains(&self, key: &str) -> Result<bool>;
}

struct WorkItem {
    operation_id: String,
    kind: OperationKind,
    key: String,
    targets: Vec<StorageNode>,
    payload: Option<Bytes>,
    metadata: Option<ObjectMetadata>,
    policy: ReplicationPolicy,
    result_tx: Option<oneshot::Sender<Operation>>,
    cancel_rx: watch::Receiver<bool>,
    followup: bool,
}

/// Caller-side handle to a submitted operation
pub struct ReplicationHandle {
    /// Id of the tracked operation
    pub operation_id: String,

    result_rx: oneshot::Receiver<Operation>,
    cancel_tx: watch::Sender<bool>,
}

impl ReplicationHandle {
    /// Ask the worker to stop attempting remaining targets.
    ///
    /// Already-uploaded replicas are not rolled back; the operation ends
    /// failed with a "cancelled" error.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the operation to reach a terminal state.
    pub async fn wait(self) -> Result<Operation> {
        self.result_rx
            .await
            .map_err(|_| StorageNodeError::Internal("replication worker dropped".to_string()))
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

/// Coordinator owning the replication worker pools
pub struct ReplicationCoordinator {
    node_id: NodeId,
    config: ReplicationConfig,
    transport: Arc<dyn PeerTransport>,
    local: Arc<dyn LocalObjectSource>,
    operations: Arc<DashMap<String, Operation>>,
    statuses: Arc<DashMap<String, ReplicationStatus>>,
    replication_tx: mpsc::Sender<WorkItem>,
    sync_tx: mpsc::Sender<WorkItem>,
    replication_rx: SharedReceiver,
    sync_rx: SharedReceiver,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl ReplicationCoordinator {
    pub fn new(
        node_id: impl Into<NodeId>,
        config: ReplicationConfig,
        transport: Arc<dyn PeerTransport>,
        local: Arc<dyn LocalObjectSource>,
    ) -> Arc<Self> {
        let capacity = config.max_concurrent_syncs.max(1) * QUEUE_CAPACITY_PER_WORKER;
        let (replication_tx, replication_rx) = mpsc::channel(capacity);
        let (sync_tx, sync_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            config,
            transport,
            local,
            operations: Arc::new(DashMap::new()),
            statuses: Arc::new(DashMap::new()),
            replication_tx,
            sync_tx,
            replication_rx: Arc::new(Mutex::new(replication_rx)),
            sync_rx: Arc::new(Mutex::new(sync_rx)),
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the worker pools and the operation cleanup sweep.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self.config.max_concurrent_syncs.max(1);
        for rx in [&self.replication_rx, &self.sync_rx] {
            for _ in 0..workers {
                let coordinator = Arc::clone(self);
                let rx = Arc::clone(rx);
                let shutdown = self.shutdown_tx.subscribe();
                tokio::spawn(coordinator.worker_loop(rx, shutdown));
            }
        }
        self.spawn_cleanup();
        info!(
            "replication coordinator started with {} workers per queue",
            workers
        );
    }

    /// Signal all workers and the cleanup sweep to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A receiver that fires when the coordinator is stopped.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Keys with terminally failed replicas, with the failing nodes.
    pub fn failed_replicas(&self) -> Vec<(String, Vec<NodeId>)> {
        self.statuses
            .iter()
            .filter_map(|status| {
                let failed: Vec<NodeId> = status
                    .per_node_sync_state
                    .iter()
                    .filter(|(_, state)| **state == SyncState::Failed)
                    .map(|(id, _)| id.clone())
                    .collect();
                if failed.is_empty() {
                    None
                } else {
                    Some((status.key.clone(), failed))
                }
            })
            .collect()
    }

    /// Submit a replication operation.
    ///
    /// Blocks up to `deadline` (default five seconds) when the queue is
    /// full, then fails with `Timeout`.
    pub async fn submit(
        &self,
        kind: OperationKind,
        key: &str,
        targets: Vec<StorageNode>,
        payload: Option<Bytes>,
        metadata: Option<ObjectMetadata>,
        policy: ReplicationPolicy,
        deadline: Option<Duration>,
    ) -> Result<ReplicationHandle> {
        validate_policy(&policy)?;
        let operation = Operation::new(
            kind,
            key,
            self.node_id.clone(),
            targets.iter().map(|t| t.id.clone()).collect(),
        );

        if matches!(kind, OperationKind::Replicate | OperationKind::Sync) {
            self.assign_replicas(key, &targets);
        }
        self.operations
            .insert(operation.id.clone(), operation.clone());

        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let item = WorkItem {
            operation_id: operation.id.clone(),
            kind,
            key: key.to_string(),
            targets,
            payload,
            metadata,
            policy,
            result_tx: Some(result_tx),
            cancel_rx,
            followup: false,
        };

        let tx = match kind {
            OperationKind::Sync => &self.sync_tx,
            _ => &self.replication_tx,
        };
        let wait = deadline.unwrap_or(SUBMIT_WAIT);
        if let Err(e) = tx.send_timeout(item, wait).await {
            self.operations.remove(&operation.id);
            return Err(match e {
                SendTimeoutError::Timeout(_) => StorageNodeError::Timeout(format!(
                    "replication queue full after {}ms",
                    wait.as_millis()
                )),
                SendTimeoutError::Closed(_) => {
                    StorageNodeError::Unavailable("replication coordinator stopped".to_string())
                }
            });
        }
        Ok(ReplicationHandle {
            operation_id: operation.id,
            result_rx,
            cancel_tx,
        })
    }

    /// Replication status for a key, if the coordinator tracks one.
    pub fn get_status(&self, key: &str) -> Option<ReplicationStatus> {
        self.statuses.get(key).map(|s| s.clone())
    }

    /// Drop the replication status for a deleted object.
    pub fn remove_status(&self, key: &str) {
        self.statuses.remove(key);
    }

    /// Tracked operation record by id.
    pub fn get_operation(&self, operation_id: &str) -> Option<Operation> {
        self.operations.get(operation_id).map(|o| o.clone())
    }

    /// All tracked operations, newest unspecified order.
    pub fn list_operations(&self) -> Vec<Operation> {
        self.operations.iter().map(|o| o.clone()).collect()
    }

    /// Mean replica count across tracked keys; zero when none are tracked.
    pub fn average_replica_count(&self) -> f64 {
        let mut keys = 0usize;
        let mut replicas = 0usize;
        for status in self.statuses.iter() {
            keys += 1;
            replicas += status.current_count;
        }
        if keys == 0 {
            0.0
        } else {
            replicas as f64 / keys as f64
        }
    }

    /// Fraction of tracked replicas confirmed in sync, in [0, 1].
    pub fn replica_health_fraction(&self) -> f64 {
        let mut total = 0usize;
        let mut healthy = 0usize;
        for status in self.statuses.iter() {
            total += status.per_node_sync_state.len();
            healthy += status
                .per_node_sync_state
                .values()
                .filter(|s| **s == SyncState::Synced)
                .count();
        }
        if total == 0 {
            1.0
        } else {
            healthy as f64 / total as f64
        }
    }

    /// Bring a key's replica set into conformance with a new policy.
    ///
    /// Compares the tracked status against the policy and enqueues removals
    /// for excluded or surplus replicas and replication for any deficit.
    pub async fn apply_policy(
        &self,
        key: &str,
        policy: &ReplicationPolicy,
        cluster: &[StorageNode],
    ) -> Result<Vec<ReplicationHandle>> {
        validate_policy(policy)?;
        let current_peers: Vec<NodeId> = self
            .get_status(key)
            .map(|s| {
                s.replica_nodes
                    .iter()
                    .filter(|id| **id != self.node_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let mut handles = Vec::new();

        let mut to_remove: Vec<NodeId> = current_peers
            .iter()
            .filter(|id| policy.excluded_nodes.contains(id))
            .cloned()
            .collect();
        let remaining: Vec<NodeId> = current_peers
            .iter()
            .filter(|id| !to_remove.contains(id))
            .cloned()
            .collect();
        if remaining.len() > policy.max_replicas {
            let mut surplus_candidates: Vec<NodeId> = remaining
                .iter()
                .filter(|id| !policy.preferred_nodes.contains(id))
                .cloned()
                .collect();
            surplus_candidates.sort();
            surplus_candidates.reverse();
            to_remove.extend(
                surplus_candidates
                    .into_iter()
                    .take(remaining.len() - policy.max_replicas),
            );
        }

        if !to_remove.is_empty() {
            let mut removable = Vec::new();
            for id in &to_remove {
                match cluster.iter().find(|n| &n.id == id) {
                    Some(node) => removable.push(node.clone()),
                    None => {
                        // The node left the cluster; just forget the replica.
                        self.forget_replica(key, id);
                    }
                }
            }
            if !removable.is_empty() {
                handles.push(
                    self.submit(
                        OperationKind::Remove,
                        key,
                        removable,
                        None,
                        None,
                        policy.clone(),
                        None,
                    )
                    .await?,
                );
            }
        }

        let kept: Vec<NodeId> = remaining
            .into_iter()
            .filter(|id| !to_remove.contains(id))
            .collect();
        // Nothing to push until the object actually exists locally.
        let object_present = self.local.contains(key).await.unwrap_or(false);
        if object_present && kept.len() < policy.min_replicas {
            let deficit = policy.min_replicas - kept.len();
            let candidates: Vec<StorageNode> = cluster
                .iter()
                .filter(|n| n.id != self.node_id && !kept.contains(&n.id))
                .cloned()
                .collect();
            let mut selected = policy
                .strategy
                .select_targets(&self.node_id, &candidates, policy);
            selected.truncate(deficit);
            if !selected.is_empty() {
                handles.push(
                    self.submit(
                        OperationKind::Replicate,
                        key,
                        selected,
                        None,
                        None,
                        policy.clone(),
                        None,
                    )
                    .await?,
                );
            } else {
                warn!(
                    "policy for {} wants {} more replicas but no eligible nodes exist",
                    key, deficit
                );
            }
        }
        Ok(handles)
    }

    fn assign_replicas(&self, key: &str, targets: &[StorageNode]) {
        let mut status = self.statuses.entry(key.to_string()).or_insert_with(|| {
            let mut s = ReplicationStatus::new(key, vec![self.node_id.clone()]);
            s.per_node_sync_state
                .insert(self.node_id.clone(), SyncState::Synced);
            s.recount();
            s
        });
        for target in targets {
            if !status.replica_nodes.contains(&target.id) {
                status.replica_nodes.push(target.id.clone());
            }
            status
                .per_node_sync_state
                .entry(target.id.clone())
                .or_insert(SyncState::Pending);
        }
        status.recount();
    }

    fn mark_replica(&self, key: &str, node_id: &NodeId, state: SyncState) {
        if let Some(mut status) = self.statuses.get_mut(key) {
            status
                .per_node_sync_state
                .insert(node_id.clone(), state);
            status.recount();
        }
    }

    fn forget_replica(&self, key: &str, node_id: &NodeId) {
        if let Some(mut status) = self.statuses.get_mut(key) {
            status.replica_nodes.retain(|id| id != node_id);
            status.per_node_sync_state.remove(node_id);
            status.recount();
        }
    }

    fn update_operation<F: FnOnce(&mut Operation)>(&self, operation_id: &str, f: F) {
        if let Some(mut op) = self.operations.get_mut(operation_id) {
            f(&mut op);
        }
    }

    fn spawn_cleanup(self: &Arc<Self>) {
        let operations = Arc::clone(&self.operations);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now() - chrono::Duration::hours(1);
                        let before = operations.len();
                        operations.retain(|_, op| {
                            !(op.is_terminal()
                                && op.completed_at.map(|t| t < cutoff).unwrap_or(false))
                        });
                        let pruned = before - operations.len();
                        if pruned > 0 {
                            debug!("pruned {} finished operations", pruned);
                        }
                    }
                }
            }
        });
    }

    async fn worker_loop(
        self: Arc<Self>,
        rx: SharedReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => break,
                item = async { rx.lock().await.recv().await } => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process(item).await;
        }
    }

    async fn process(&self, mut item: WorkItem) {
        self.update_operation(&item.operation_id, |op| {
            op.state = OperationState::InProgress;
            op.started_at = Some(Utc::now());
        });

        let (successes, failures, cancelled) = match item.kind {
            OperationKind::Replicate | OperationKind::Sync => self.process_push(&mut item).await,
            OperationKind::Remove => self.process_remove(&item).await,
            OperationKind::Verify => self.process_verify(&mut item).await,
        };

        let total = item.targets.len().max(1);
        let completed = if cancelled {
            false
        } else {
            match item.kind {
                OperationKind::Verify => failures.is_empty(),
                OperationKind::Remove => match item.policy.consistency_level {
                    ConsistencyLevel::Strong => failures.is_empty(),
                    _ => true,
                },
                _ => match item.policy.consistency_level {
                    ConsistencyLevel::Strong => failures.is_empty(),
                    ConsistencyLevel::Eventual => successes >= 1 || item.targets.is_empty(),
                    ConsistencyLevel::Weak => true,
                },
            }
        };
        let error = if cancelled {
            Some("cancelled".to_string())
        } else if failures.is_empty() {
            None
        } else {
            Some(
                failures
                    .iter()
                    .map(|(node, e)| format!("{node}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        self.update_operation(&item.operation_id, |op| {
            op.state = if completed {
                OperationState::Completed
            } else {
                OperationState::Failed
            };
            op.progress = successes as f64 / total as f64;
            op.completed_at = Some(Utc::now());
            op.error = error.clone();
        });
        if let Some(mut status) = self.statuses.get_mut(&item.key) {
            status.last_sync_time = Some(Utc::now());
            status.recount();
        }

        // Under eventual consistency the laggards keep converging in the
        // background through one follow-up sync pass.
        if item.kind == OperationKind::Replicate
            && item.policy.consistency_level == ConsistencyLevel::Eventual
            && !item.followup
            && !cancelled
            && !failures.is_empty()
        {
            self.resubmit_failed(&item, &failures);
        }

        if let Some(op) = self.get_operation(&item.operation_id) {
            if let Some(tx) = item.result_tx.take() {
                let _ = tx.send(op);
            }
        }
    }

    fn resubmit_failed(&self, item: &WorkItem, failures: &[(NodeId, String)]) {
        let failed_targets: Vec<StorageNode> = item
            .targets
            .iter()
            .filter(|t| failures.iter().any(|(id, _)| id == &t.id))
            .cloned()
            .collect();
        if failed_targets.is_empty() {
            return;
        }
        let operation = Operation::new(
            OperationKind::Sync,
            &item.key,
            self.node_id.clone(),
            failed_targets.iter().map(|t| t.id.clone()).collect(),
        );
        let (_, cancel_rx) = watch::channel(false);
        let followup = WorkItem {
            operation_id: operation.id.clone(),
            kind: OperationKind::Sync,
            key: item.key.clone(),
            targets: failed_targets,
            payload: item.payload.clone(),
            metadata: item.metadata.clone(),
            policy: item.policy.clone(),
            result_tx: None,
            cancel_rx,
            followup: true,
        };
        let followup_id = operation.id.clone();
        self.operations.insert(followup_id.clone(), operation);
        if self.sync_tx.try_send(followup).is_err() {
            self.operations.remove(&followup_id);
            warn!(
                "sync queue full, dropping follow-up replication for {}",
                item.key
            );
        }
    }

    async fn process_push(&self, item: &mut WorkItem) -> (usize, Vec<(NodeId, String)>, bool) {
        if item.payload.is_none() || item.metadata.is_none() {
            match self.local.read_object(&item.key).await {
                Ok((payload, metadata)) => {
                    item.payload = Some(payload);
                    item.metadata = Some(metadata);
                }
                Err(e) => {
                    return (
                        0,
                        vec![(self.node_id.clone(), format!("reading local object: {e}"))],
                        false,
                    );
                }
            }
        }
        let (Some(payload), Some(metadata)) = (item.payload.clone(), item.metadata.clone()) else {
            return (
                0,
                vec![(self.node_id.clone(), "missing payload".to_string())],
                false,
            );
        };

        let ordered = item
            .policy
            .strategy
            .replication_order(&self.node_id, item.targets.clone());
        let mut successes = 0usize;
        let mut failures: Vec<(NodeId, String)> = Vec::new();

        if item.policy.strategy.parallel_dispatch() {
            let results = futures::future::join_all(ordered.iter().map(|target| {
                self.push_one(
                    target,
                    &item.key,
                    payload.clone(),
                    metadata.clone(),
                    item.cancel_rx.clone(),
                    &item.operation_id,
                )
            }))
            .await;
            for (target, result) in ordered.iter().zip(results) {
                match result {
                    Ok(()) => successes += 1,
                    Err(e) => failures.push((target.id.clone(), e.to_string())),
                }
            }
        } else {
            for target in &ordered {
                if *item.cancel_rx.borrow() {
                    return (successes, failures, true);
                }
                match self
                    .push_one(
                        target,
                        &item.key,
                        payload.clone(),
                        metadata.clone(),
                        item.cancel_rx.clone(),
                        &item.operation_id,
                    )
                    .await
                {
                    Ok(()) => successes += 1,
                    Err(e) => failures.push((target.id.clone(), e.to_string())),
                }
            }
        }
        let cancelled = *item.cancel_rx.borrow();
        (successes, failures, cancelled)
    }

    async fn push_one(
        &self,
        target: &StorageNode,
        key: &str,
        payload: Bytes,
        metadata: ObjectMetadata,
        cancel_rx: watch::Receiver<bool>,
        operation_id: &str,
    ) -> Result<()> {
        self.mark_replica(key, &target.id, SyncState::InProgress);
        let timeout = Duration::from_millis(self.config.sync_timeout_ms);
        let mut last_err =
            StorageNodeError::Unavailable(format!("no attempt made against {}", target.id));

        for attempt in 0..=self.config.retry_attempts {
            if *cancel_rx.borrow() {
                self.mark_replica(key, &target.id, SyncState::Failed);
                return Err(StorageNodeError::Internal("cancelled".to_string()));
            }
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.config.retry_delay_ms, attempt)).await;
                self.update_operation(operation_id, |op| op.retry_count += 1);
            }
            let result = tokio::time::timeout(
                timeout,
                self.transport
                    .replicate(target, key, payload.clone(), &metadata, timeout),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    self.mark_replica(key, &target.id, SyncState::Synced);
                    return Ok(());
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => {
                    last_err = StorageNodeError::Timeout(format!(
                        "replicating {key} to {} took over {}ms",
                        target.id, self.config.sync_timeout_ms
                    ))
                }
            }
            debug!(
                "replication attempt {} for {} to {} failed: {}",
                attempt + 1,
                key,
                target.id,
                last_err
            );
        }
        self.mark_replica(key, &target.id, SyncState::Failed);
        Err(last_err)
    }

    async fn process_remove(&self, item: &WorkItem) -> (usize, Vec<(NodeId, String)>, bool) {
        let timeout = Duration::from_millis(self.config.sync_timeout_ms);
        let mut successes = 0usize;
        let mut failures: Vec<(NodeId, String)> = Vec::new();

        for target in &item.targets {
            if *item.cancel_rx.borrow() {
                return (successes, failures, true);
            }
            let mut removed = false;
            let mut last_err = String::new();
            for attempt in 0..=self.config.retry_attempts {
                if attempt > 0 {
                    tokio::time::sleep(backoff_delay(self.config.retry_delay_ms, attempt)).await;
                    self.update_operation(&item.operation_id, |op| op.retry_count += 1);
                }
                match tokio::time::timeout(
                    timeout,
                    self.transport.delete(target, &item.key, timeout),
                )
                .await
                {
                    Ok(Ok(())) => {
                        removed = true;
                        break;
                    }
                    Ok(Err(e)) => last_err = e.to_string(),
                    Err(_) => last_err = "timed out".to_string(),
                }
            }
            if removed {
                self.forget_replica(&item.key, &target.id);
                successes += 1;
            } else {
                failures.push((target.id.clone(), last_err));
            }
        }
        (successes, failures, *item.cancel_rx.borrow())
    }

    async fn process_verify(&self, item: &mut WorkItem) -> (usize, Vec<(NodeId, String)>, bool) {
        if item.metadata.is_none() {
            match self.local.read_object(&item.key).await {
                Ok((_, metadata)) => item.metadata = Some(metadata),
                Err(e) => {
                    return (
                        0,
                        vec![(self.node_id.clone(), format!("reading local object: {e}"))],
                        false,
                    );
                }
            }
        }
        let Some(metadata) = item.metadata.clone() else {
            return (
                0,
                vec![(self.node_id.clone(), "missing metadata".to_string())],
                false,
            );
        };

        let timeout = Duration::from_millis(self.config.sync_timeout_ms);
        let mut successes = 0usize;
        let mut failures: Vec<(NodeId, String)> = Vec::new();

        for target in &item.targets {
            if *item.cancel_rx.borrow() {
                return (successes, failures, true);
            }
            match tokio::time::timeout(
                timeout,
                self.transport.retrieve(target, &item.key, timeout),
            )
            .await
            {
                Ok(Ok((bytes, _))) => {
                    let mut hasher = Sha256::new();
                    hasher.update(&bytes);
                    let remote_hash = hex::encode(hasher.finalize());
                    if remote_hash == metadata.hash {
                        self.mark_replica(&item.key, &target.id, SyncState::Synced);
                        successes += 1;
                    } else {
                        self.mark_replica(&item.key, &target.id, SyncState::Failed);
                        failures.push((
                            target.id.clone(),
                            format!("hash mismatch: expected {}, got {remote_hash}", metadata.hash),
                        ));
                    }
                }
                Ok(Err(e)) => {
                    self.mark_replica(&item.key, &target.id, SyncState::Failed);
                    failures.push((target.id.clone(), e.to_string()));
                }
                Err(_) => {
                    self.mark_replica(&item.key, &target.id, SyncState::Failed);
                    failures.push((target.id.clone(), "timed out".to_string()));
                }
            }
        }
        (successes, failures, *item.cancel_rx.borrow())
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}
