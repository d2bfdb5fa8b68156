//! Core consensus types: terms, log indexes, entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Election term number (monotonically increasing).
///
/// Terms are the logical clock of the protocol. Each term has at most one
/// leader; a node increments its term when it starts an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is the sentinel for "no entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Broker node identifier (unique across the cluster).
///
/// A string so deployments can use DNS names, UUIDs, or host:port pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single replicated log entry.
///
/// The command payload is opaque to consensus; the registry state machine
/// interprets it once the entry commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Bytes) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// RequestVote RPC request, sent by a candidate to all peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request: log replication and heartbeats.
///
/// An empty entries list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's id, so followers can hand out leader hints
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the prev_log_index entry
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself
    pub term: Term,

    /// True if the follower's log matched prev_log_index/prev_log_term
    pub success: bool,

    /// Backtracking hint for the leader on conflict
    pub conflict_index: Option<LogIndex>,

    /// Follower's last log index (for match tracking)
    pub last_log_index: LogIndex,
}

/// InstallSnapshot RPC request.
///
/// Sent when a follower is so far behind that the entries it needs have
/// been compacted away. Snapshots here are full-state and small enough to
/// ship in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's id
    pub leader_id: NodeId,

    /// Index of the last entry covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of last_included_index
    pub last_included_term: Term,

    /// Encoded snapshot (see `snapshot::Snapshot`)
    pub data: Bytes,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Follower's current term
    pub term: Term,

    /// True if the follower accepted the snapshot
    pub installed: bool,
}

/// Fixed cluster membership.
///
/// The member set comes from configuration and does not change at runtime,
/// so quorum math stays over a single stable set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembers(pub Vec<NodeId>);

impl ClusterMembers {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        ClusterMembers(nodes)
    }

    pub fn all(&self) -> &[NodeId] {
        &self.0
    }

    /// Every member except `me`.
    pub fn peers_of(&self, me: &NodeId) -> Vec<NodeId> {
        self.0.iter().filter(|n| *n != me).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Majority size for this membership.
    pub fn quorum(&self) -> usize {
        self.0.len() / 2 + 1
    }

    /// Check whether `votes` constitutes a majority.
    pub fn has_quorum(&self, votes: &[NodeId]) -> bool {
        let count = self.0.iter().filter(|n| votes.contains(n)).count();
        count >= self.quorum()
    }
}

/// Consensus role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Liveness of a peer as observed locally.
///
/// The leader derives this from replication ack recency; everyone else
/// only knows about the leader it last heard from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Up => write!(f, "up"),
            PeerStatus::Down => write!(f, "down"),
            PeerStatus::Unknown => write!(f, "unknown"),
        }
    }
}
