//! Consensus error types.

use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

/// Consensus errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot handle a write/propose).
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Quorum unavailable (not enough replicas reachable).
    #[error("Quorum unavailable (need {needed}, have {available})")]
    QuorumUnavailable { needed: usize, available: usize },

    /// A proposed entry did not commit within the propose timeout.
    ///
    /// The outcome is unknown: the entry may still commit later.
    #[error("Commit timeout after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// Term mismatch (request from an old term).
    #[error("Term mismatch (current: {current}, request: {request})")]
    TermMismatch { current: Term, request: Term },

    /// A committed entry is missing or does not match its expected term.
    ///
    /// This is a detected safety violation; the broker must stop and be
    /// restarted from snapshot by an operator.
    #[error("Log diverged at index {index}")]
    Diverged { index: LogIndex },

    /// Persisted log record failed its checksum.
    #[error("Corrupt log record: {reason}")]
    Corrupt { reason: String },

    /// Snapshot save/load/install failed.
    #[error("Snapshot failed: {reason}")]
    SnapshotFailed { reason: String },

    /// Invalid configuration.
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// I/O error (log file, network, etc.).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Consensus result type.
pub type Result<T> = std::result::Result<T, RaftError>;
