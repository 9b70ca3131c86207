// Consensus state oracle
//
// The storage core reads cluster leadership and health from an external
// consensus implementation; it never participates in log replication or
// leader election itself. This module defines the read-only view and a
// process-local implementation for single-node deployments and tests.

use crate::types::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Snapshot of the external consensus component's view of the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Current leader, if one is elected
    pub leader_id: Option<NodeId>,

    /// Current term
    pub term: u64,

    /// Whether consensus is operating normally
    pub is_healthy: bool,

    /// Members participating in consensus
    pub members: Vec<NodeId>,
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self {
            leader_id: None,
            term: 0,
            is_healthy: false,
            members: Vec::new(),
        }
    }
}

/// Read-only view of the external consensus component.
pub trait ConsensusOracle: Send + Sync {
    /// The oracle's current view of the cluster.
    fn state(&self) -> ConsensusState;
}

/// Process-local oracle holding a mutable state snapshot.
///
/// Useful for single-node deployments (never healthy, so writes take the
/// direct path) and for tests that script leadership changes.
#[derive(Default)]
pub struct LocalConsensusOracle {
    state: RwLock<ConsensusState>,
}

impl LocalConsensusOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// An oracle reporting a healthy cluster led by `leader`.
    pub fn with_leader(leader: impl Into<NodeId>, members: Vec<NodeId>) -> Self {
        let leader = leader.into();
        Self {
            state: RwLock::new(ConsensusState {
                leader_id: Some(leader),
                term: 1,
                is_healthy: true,
                members,
            }),
        }
    }

    /// Replace the published state.
    pub fn set_state(&self, state: ConsensusState) {
        *self.state.write() = state;
    }
}

impl ConsensusOracle for LocalConsensusOracle {
    fn state(&self) -> ConsensusState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_oracle_is_unhealthy() {
        let oracle = LocalConsensusOracle::new();
        let state = oracle.state();
        assert!(!state.is_healthy);
        assert!(state.leader_id.is_none());
    }

    #[test]
    fn leader_oracle_reports_health() {
        let oracle =
            LocalConsensusOracle::with_leader("node-1", vec!["node-1".into(), "node-2".into()]);
        let state = oracle.state();
        assert!(state.is_healthy);
        assert_eq!(state.leader_id.as_deref(), Some("node-1"));
        assert_eq!(state.members.len(), 2);
    }

    #[test]
    fn set_state_replaces_snapshot() {
        let oracle = LocalConsensusOracle::new();
        oracle.set_state(ConsensusState {
            leader_id: Some("node-9".into()),
            term: 7,
            is_healthy: true,
            members: vec!["node-9".into()],
        });
        assert_eq!(oracle.state().term, 7);
    }
}
