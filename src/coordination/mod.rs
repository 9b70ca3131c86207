// Coordination module for the object storage node
//
// Named leased locks and the read-only consensus state oracle.

/// Consensus state oracle interface
pub mod consensus;
/// Leased exclusive lock registry
pub mod locks;

pub use consensus::{ConsensusOracle, ConsensusState, LocalConsensusOracle};
pub use locks::{LockHandle, LockRecord, LockRegistry};
