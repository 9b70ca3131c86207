// Replication placement policies and strategies
//
// The three strategies share one capability set: decide whether a key
// should replicate at all, select target nodes from the candidates, and
// fix the dispatch order. Scores combine node health, free capacity, and
// load; ties always break on node id so selection is deterministic.

use crate::error::{Result, StorageNodeError};
use crate::types::{
    ConsistencyLevel, NodeId, ObjectMetadata, ReplicationPolicy, ReplicationStrategyKind,
    StorageNode,
};
use chrono::Utc;
use std::collections::HashMap;

/// Objects younger than this are skipped by the lazy strategy.
const LAZY_AGE_SECS: i64 = 3600;

/// Score bonus for nodes named in the policy's preferred list.
const PREFERRED_BONUS: f64 = 40.0;

/// Score bonus for nodes outside the source's region (geographic spread).
const REGION_SPREAD_BONUS: f64 = 10.0;

/// Validate a replication policy.
pub fn validate_policy(policy: &ReplicationPolicy) -> Result<()> {
    if policy.min_replicas < 1 {
        return Err(StorageNodeError::InvalidArgument(
            "min_replicas must be at least 1".to_string(),
        ));
    }
    if policy.max_replicas < policy.min_replicas {
        return Err(StorageNodeError::InvalidArgument(format!(
            "max_replicas ({}) must be >= min_replicas ({})",
            policy.max_replicas, policy.min_replicas
        )));
    }
    Ok(())
}

/// Placement score for a candidate node.
///
/// Health contributes 100/50/0, free capacity up to 50, and an idle node
/// another 30. Preferred nodes get a flat bonus on top.
fn node_score(node: &StorageNode, policy: &ReplicationPolicy) -> f64 {
    let mut score = node.health.status.score()
        + node.capacity.available_fraction() * 50.0
        + (1.0 - node.load_factor.clamp(0.0, 1.0)) * 30.0;
    if policy.preferred_nodes.iter().any(|p| p == &node.id) {
        score += PREFERRED_BONUS;
    }
    score
}

/// Drop the source, excluded, and unavailable nodes.
fn eligible<'a>(
    source: &NodeId,
    candidates: &'a [StorageNode],
    policy: &ReplicationPolicy,
) -> Vec<&'a StorageNode> {
    candidates
        .iter()
        .filter(|n| &n.id != source)
        .filter(|n| !policy.excluded_nodes.contains(&n.id))
        .filter(|n| n.is_available())
        .collect()
}

fn sort_by_score(nodes: &mut [(&StorageNode, f64)]) {
    nodes.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl ReplicationStrategyKind {
    /// Strategy name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationStrategyKind::Eager => "eager",
            ReplicationStrategyKind::Lazy => "lazy",
            ReplicationStrategyKind::Geographic => "geographic",
        }
    }

    /// Consistency level this strategy provides.
    pub fn consistency_level(&self) -> ConsistencyLevel {
        match self {
            ReplicationStrategyKind::Eager => ConsistencyLevel::Strong,
            ReplicationStrategyKind::Lazy | ReplicationStrategyKind::Geographic => {
                ConsistencyLevel::Eventual
            }
        }
    }

    /// Whether targets are pushed concurrently rather than one by one.
    pub fn parallel_dispatch(&self) -> bool {
        matches!(self, ReplicationStrategyKind::Eager)
    }

    /// Whether this object should be replicated under this strategy.
    pub fn should_replicate(&self, metadata: &ObjectMetadata, _policy: &ReplicationPolicy) -> bool {
        match self {
            ReplicationStrategyKind::Eager | ReplicationStrategyKind::Geographic => true,
            ReplicationStrategyKind::Lazy => {
                (Utc::now() - metadata.created_at).num_seconds() > LAZY_AGE_SECS
            }
        }
    }

    /// Select replication targets from the candidate set.
    pub fn select_targets(
        &self,
        source: &NodeId,
        candidates: &[StorageNode],
        policy: &ReplicationPolicy,
    ) -> Vec<StorageNode> {
        let eligible = eligible(source, candidates, policy);
        match self {
            ReplicationStrategyKind::Eager => {
                let mut scored: Vec<(&StorageNode, f64)> = eligible
                    .into_iter()
                    .map(|n| (n, node_score(n, policy)))
                    .collect();
                sort_by_score(&mut scored);
                scored
                    .into_iter()
                    .take(policy.max_replicas)
                    .map(|(n, _)| n.clone())
                    .collect()
            }
            ReplicationStrategyKind::Lazy => {
                let mut scored: Vec<(&StorageNode, f64)> = eligible
                    .into_iter()
                    .map(|n| (n, node_score(n, policy)))
                    .collect();
                sort_by_score(&mut scored);
                let count = policy.min_replicas.div_ceil(2).max(1);
                scored
                    .into_iter()
                    .take(count)
                    .map(|(n, _)| n.clone())
                    .collect()
            }
            ReplicationStrategyKind::Geographic => {
                let source_region = candidates
                    .iter()
                    .find(|n| &n.id == source)
                    .map(|n| n.region.clone());

                // Best node per distinct region, spread bonus for regions
                // away from the source.
                let mut per_region: HashMap<&str, (&StorageNode, f64)> = HashMap::new();
                for node in eligible {
                    let mut score = node_score(node, policy);
                    if source_region.as_deref() != Some(node.region.as_str()) {
                        score += REGION_SPREAD_BONUS;
                    }
                    let replace = match per_region.get(node.region.as_str()) {
                        Some((best, best_score)) => {
                            score > *best_score
                                || (score == *best_score && node.id < best.id)
                        }
                        None => true,
                    };
                    if replace {
                        per_region.insert(node.region.as_str(), (node, score));
                    }
                }

                let mut picks: Vec<(&StorageNode, f64)> = per_region.into_values().collect();
                sort_by_score(&mut picks);
                picks
                    .into_iter()
                    .take(policy.max_replicas)
                    .map(|(n, _)| n.clone())
                    .collect()
            }
        }
    }

    /// Dispatch order over the selected targets.
    ///
    /// The eager strategy pushes everything concurrently, so order is only
    /// cosmetic there; the others honor it sequentially.
    pub fn replication_order(
        &self,
        _source: &NodeId,
        targets: Vec<StorageNode>,
    ) -> Vec<StorageNode> {
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeCapacity, NodeHealthState};

    fn node(id: &str, region: &str, health: NodeHealthState, load: f64) -> StorageNode {
        let mut n = StorageNode::new(id, format!("{id}:7000"), region);
        n.health.status = health;
        n.load_factor = load;
        n.capacity = NodeCapacity {
            total: 100,
            used: 50,
            available: 50,
        };
        n
    }

    fn policy(min: usize, max: usize, strategy: ReplicationStrategyKind) -> ReplicationPolicy {
        ReplicationPolicy {
            min_replicas: min,
            max_replicas: max,
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn policy_validation() {
        assert!(validate_policy(&policy(1, 3, ReplicationStrategyKind::Eager)).is_ok());
        assert_eq!(
            validate_policy(&policy(0, 3, ReplicationStrategyKind::Eager))
                .unwrap_err()
                .code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            validate_policy(&policy(3, 2, ReplicationStrategyKind::Eager))
                .unwrap_err()
                .code(),
            "INVALID_ARGUMENT"
        );
    }

    #[test]
    fn eager_selects_top_scored_up_to_max() {
        let candidates = vec![
            node("a", "r1", NodeHealthState::Healthy, 0.1),
            node("b", "r1", NodeHealthState::Degraded, 0.1),
            node("c", "r1", NodeHealthState::Healthy, 0.9),
            node("src", "r1", NodeHealthState::Healthy, 0.0),
        ];
        let targets = ReplicationStrategyKind::Eager.select_targets(
            &"src".to_string(),
            &candidates,
            &policy(2, 2, ReplicationStrategyKind::Eager),
        );
        let ids: Vec<&str> = targets.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn selection_excludes_source_excluded_and_unavailable() {
        let candidates = vec![
            node("a", "r1", NodeHealthState::Healthy, 0.1),
            node("b", "r1", NodeHealthState::Down, 0.1),
            node("c", "r1", NodeHealthState::Healthy, 0.1),
            node("src", "r1", NodeHealthState::Healthy, 0.0),
        ];
        let mut p = policy(1, 5, ReplicationStrategyKind::Eager);
        p.excluded_nodes = vec!["c".to_string()];
        let targets = ReplicationStrategyKind::Eager.select_targets(
            &"src".to_string(),
            &candidates,
            &p,
        );
        let ids: Vec<&str> = targets.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn preferred_nodes_win_ties() {
        let candidates = vec![
            node("a", "r1", NodeHealthState::Healthy, 0.5),
            node("b", "r1", NodeHealthState::Healthy, 0.5),
        ];
        let mut p = policy(1, 1, ReplicationStrategyKind::Eager);
        p.preferred_nodes = vec!["b".to_string()];
        let targets = ReplicationStrategyKind::Eager.select_targets(
            &"src".to_string(),
            &candidates,
            &p,
        );
        assert_eq!(targets[0].id, "b");
    }

    #[test]
    fn lazy_takes_half_of_min_and_skips_fresh_objects() {
        let strategy = ReplicationStrategyKind::Lazy;
        let candidates = vec![
            node("a", "r1", NodeHealthState::Healthy, 0.1),
            node("b", "r1", NodeHealthState::Healthy, 0.2),
            node("c", "r1", NodeHealthState::Healthy, 0.3),
        ];
        let p = policy(3, 5, ReplicationStrategyKind::Lazy);
        let targets = strategy.select_targets(&"src".to_string(), &candidates, &p);
        assert_eq!(targets.len(), 2); // ceil(3/2)

        let fresh = ObjectMetadata::new("k");
        assert!(!strategy.should_replicate(&fresh, &p));

        let mut aged = ObjectMetadata::new("k");
        aged.created_at = Utc::now() - chrono::Duration::seconds(LAZY_AGE_SECS + 60);
        assert!(strategy.should_replicate(&aged, &p));
    }

    #[test]
    fn geographic_picks_one_node_per_region() {
        let candidates = vec![
            node("a1", "r1", NodeHealthState::Healthy, 0.1),
            node("a2", "r1", NodeHealthState::Healthy, 0.5),
            node("b1", "r2", NodeHealthState::Healthy, 0.2),
            node("c1", "r3", NodeHealthState::Degraded, 0.1),
            node("src", "r1", NodeHealthState::Healthy, 0.0),
        ];
        let targets = ReplicationStrategyKind::Geographic.select_targets(
            &"src".to_string(),
            &candidates,
            &policy(1, 2, ReplicationStrategyKind::Geographic),
        );
        assert_eq!(targets.len(), 2);
        let regions: Vec<&str> = targets.iter().map(|n| n.region.as_str()).collect();
        assert!(regions.contains(&"r2"));
        // Within r1, the less loaded node wins.
        if let Some(r1_pick) = targets.iter().find(|n| n.region == "r1") {
            assert_eq!(r1_pick.id, "a1");
        }
    }

    #[test]
    fn strategy_consistency_levels() {
        assert_eq!(
            ReplicationStrategyKind::Eager.consistency_level(),
            ConsistencyLevel::Strong
        );
        assert_eq!(
            ReplicationStrategyKind::Lazy.consistency_level(),
            ConsistencyLevel::Eventual
        );
        assert!(ReplicationStrategyKind::Eager.parallel_dispatch());
        assert!(!ReplicationStrategyKind::Lazy.parallel_dispatch());
    }
}
