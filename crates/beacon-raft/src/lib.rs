//! beacon-raft: Raft consensus for the broker cluster.
//!
//! Provides:
//! - Leader election with randomized timeouts
//! - Heartbeat-driven log replication with majority commit
//! - A sequential apply path driving a pluggable state machine
//! - Post-commit proposal acknowledgment (propose waits for apply)
//! - Snapshotting with retention and optional compression
//! - InstallSnapshot catch-up for followers behind the compaction point
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).

pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod replication;
pub mod rpc_handler;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

mod raft;

pub use config::{RaftConfig, SnapshotPolicy};
pub use error::{RaftError, Result};
pub use raft::Raft;
pub use snapshot::{Snapshot, SnapshotStore, StateMachine};
pub use types::*;

/// High-level interface to the consensus module.
///
/// Implemented by [`Raft`]; kept as a trait so session code can be
/// exercised against a stub.
#[async_trait::async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Propose a command for replication and wait until it is applied.
    ///
    /// Returns the log index the command was committed at. Only the
    /// leader accepts proposals; everyone else answers `NotLeader` with a
    /// redirect hint.
    async fn propose(&self, cmd: bytes::Bytes) -> Result<LogIndex>;

    /// True if this node currently believes it is the leader.
    fn is_leader(&self) -> bool;

    /// The current leader, if known.
    fn leader(&self) -> Option<NodeId>;
}
