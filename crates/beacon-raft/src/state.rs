//! Per-node consensus state and RPC handlers.
//!
//! # Persistent state
//!
//! - `current_term`, `voted_for` (held in memory; the log itself is the
//!   durable part, see `log.rs`)
//!
//! # Volatile state (all nodes)
//!
//! - `commit_index`: highest entry known committed
//! - `last_applied`: highest entry reflected in the state machine
//!
//! # Volatile state (leader only)
//!
//! - `next_index[]` / `match_index[]` replication progress per follower
//! - `last_ack[]` for peer liveness reporting

use crate::config::RaftConfig;
use crate::error::Result;
use crate::log::RaftLog;
use crate::snapshot::Snapshot;
use crate::types::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Consensus state for one broker node.
///
/// Thread-safe via internal locking; shared across the background loops.
pub struct RaftState {
    node_id: NodeId,
    config: RaftConfig,

    persistent: RwLock<PersistentState>,
    volatile: RwLock<VolatileState>,

    log: RaftLog,

    /// Applied-index watch; `propose` waits on this for post-commit acks.
    applied_tx: watch::Sender<u64>,
}

struct PersistentState {
    /// Latest term this node has seen (monotonically increasing)
    current_term: Term,

    /// Candidate voted for in the current term, if any
    voted_for: Option<NodeId>,
}

/// Volatile state (recomputed after restart).
pub struct VolatileState {
    pub role: Role,

    /// Current leader, if known; handed to clients as a redirect hint
    pub leader_id: Option<NodeId>,

    pub commit_index: LogIndex,
    pub last_applied: LogIndex,

    /// Highest index covered by the last snapshot taken or installed
    pub last_snapshot_index: LogIndex,

    /// Leader-only replication bookkeeping
    pub leader_state: Option<LeaderState>,

    /// Last time we heard from a valid leader (election timeout basis)
    pub last_heartbeat: Instant,

    /// Snapshot received via InstallSnapshot, waiting for the apply loop
    /// to restore it (keeps the apply path the single state writer)
    pub pending_snapshot: Option<Snapshot>,

    pub members: ClusterMembers,
}

/// Leader-only volatile state.
pub struct LeaderState {
    /// Next log index to send to each peer
    pub next_index: HashMap<NodeId, LogIndex>,

    /// Highest index known replicated on each peer
    pub match_index: HashMap<NodeId, LogIndex>,

    /// Last successful response from each peer (liveness reporting)
    pub last_ack: HashMap<NodeId, Instant>,

    /// When this node became leader (uptime reporting)
    pub since: Instant,
}

impl RaftState {
    pub fn new(node_id: NodeId, config: RaftConfig, log: RaftLog, members: ClusterMembers) -> Self {
        let (applied_tx, _) = watch::channel(0);
        Self {
            node_id,
            config,
            persistent: RwLock::new(PersistentState {
                current_term: Term::ZERO,
                voted_for: None,
            }),
            volatile: RwLock::new(VolatileState {
                role: Role::Follower,
                leader_id: None,
                commit_index: LogIndex::ZERO,
                last_applied: LogIndex::ZERO,
                last_snapshot_index: LogIndex::ZERO,
                leader_state: None,
                last_heartbeat: Instant::now(),
                pending_snapshot: None,
                members,
            }),
            log,
            applied_tx,
        }
    }

    pub fn role(&self) -> Role {
        self.volatile.read().role
    }

    pub fn current_term(&self) -> Term {
        self.persistent.read().current_term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.volatile.read().leader_id.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.volatile.read().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.read().last_applied
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn log_ref(&self) -> &RaftLog {
        &self.log
    }

    pub fn volatile_state(&self) -> &RwLock<VolatileState> {
        &self.volatile
    }

    /// Record an applied index and wake propose waiters.
    pub fn mark_applied(&self, index: LogIndex) {
        {
            let mut volatile = self.volatile.write();
            if index > volatile.last_applied {
                volatile.last_applied = index;
            }
        }
        let _ = self.applied_tx.send_replace(index.as_u64());
    }

    /// Subscribe to applied-index updates.
    pub fn applied_watch(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    /// How long this node has been leader, if it is one.
    pub fn leader_uptime(&self) -> Option<Duration> {
        let volatile = self.volatile.read();
        volatile.leader_state.as_ref().map(|ls| ls.since.elapsed())
    }

    /// Liveness of every cluster member as observed from this node.
    ///
    /// A leader reports peers from replication ack recency; a follower
    /// only knows its leader (recent heartbeat) and itself.
    pub fn peer_status(&self) -> HashMap<NodeId, PeerStatus> {
        let volatile = self.volatile.read();
        let down_after = self.config.heartbeat_interval * 4;
        let mut out = HashMap::new();

        for node in volatile.members.all() {
            let status = if *node == self.node_id {
                PeerStatus::Up
            } else if let Some(leader_state) = &volatile.leader_state {
                match leader_state.last_ack.get(node) {
                    Some(at) if at.elapsed() < down_after => PeerStatus::Up,
                    Some(_) => PeerStatus::Down,
                    None => PeerStatus::Unknown,
                }
            } else if volatile.leader_id.as_ref() == Some(node) {
                if volatile.last_heartbeat.elapsed() < down_after {
                    PeerStatus::Up
                } else {
                    PeerStatus::Down
                }
            } else {
                PeerStatus::Unknown
            };
            out.insert(node.clone(), status);
        }
        out
    }

    #[cfg(test)]
    pub fn set_current_term(&self, term: Term) {
        self.persistent.write().current_term = term;
    }

    /// Handle RequestVote from a candidate.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        // Log info first so no lock is held across an await.
        let last_log_term = self.log.last_term().await;
        let last_log_index = self.log.last_index().await;

        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if request.term > persistent.current_term {
            self.step_down_inner(&mut persistent, &mut volatile, request.term);
        }

        let mut vote_granted = false;

        if request.term >= persistent.current_term {
            let already_voted = persistent
                .voted_for
                .as_ref()
                .map_or(false, |id| id != &request.candidate_id);

            if !already_voted {
                let log_ok = request.last_log_term > last_log_term
                    || (request.last_log_term == last_log_term
                        && request.last_log_index >= last_log_index);

                if log_ok {
                    vote_granted = true;
                    persistent.voted_for = Some(request.candidate_id.clone());
                    volatile.last_heartbeat = Instant::now();
                }
            }
        }

        Ok(RequestVoteResponse {
            term: persistent.current_term,
            vote_granted,
        })
    }

    /// Handle AppendEntries from a leader (replication or heartbeat).
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (current_term, should_reject) = {
            let mut persistent = self.persistent.write();
            let mut volatile = self.volatile.write();

            if request.term > persistent.current_term {
                self.step_down_inner(&mut persistent, &mut volatile, request.term);
            }

            let should_reject = request.term < persistent.current_term;

            if !should_reject {
                volatile.last_heartbeat = Instant::now();
                volatile.leader_id = Some(request.leader_id.clone());

                // Two leaders in one term cannot both survive.
                if volatile.role != Role::Follower {
                    if volatile.role == Role::Leader {
                        tracing::warn!(
                            term = %persistent.current_term,
                            "Leader stepping down after AppendEntries from {}",
                            request.leader_id
                        );
                    }
                    volatile.role = Role::Follower;
                    volatile.leader_state = None;
                }
            }

            (persistent.current_term, should_reject)
        };

        if should_reject {
            let last_log_index = self.log.last_index().await;
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: None,
                last_log_index,
            });
        }

        // Consistency check: entry at prev_log_index must match terms.
        let snapshot_floor = self.volatile.read().last_snapshot_index;
        let log_ok = if request.prev_log_index == LogIndex::ZERO
            || request.prev_log_index <= snapshot_floor
        {
            true
        } else if let Some(entry) = self.log.get(request.prev_log_index).await? {
            entry.term == request.prev_log_term
        } else {
            false
        };

        if !log_ok {
            let conflict_index = request.prev_log_index.prev();
            let last_log_index = self.log.last_index().await;
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index,
                last_log_index,
            });
        }

        if !request.entries.is_empty() {
            // Drop any conflicting suffix, then append.
            let first_new_index = request.prev_log_index.next();
            let local_last = self.log.last_index().await;
            if first_new_index <= local_last {
                self.log.truncate(first_new_index).await?;
            }
            self.log.append_batch(request.entries).await?;
        }

        let last_new_index = self.log.last_index().await;
        {
            let mut volatile = self.volatile.write();
            if request.leader_commit > volatile.commit_index {
                volatile.commit_index = std::cmp::min(request.leader_commit, last_new_index);
            }
        }

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_index: None,
            last_log_index: last_new_index,
        })
    }

    /// Handle InstallSnapshot from a leader.
    ///
    /// The snapshot is only stashed here; the apply loop performs the
    /// actual restore so the state machine keeps its single writer.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if request.term > persistent.current_term {
            self.step_down_inner(&mut persistent, &mut volatile, request.term);
        }

        if request.term < persistent.current_term {
            return Ok(InstallSnapshotResponse {
                term: persistent.current_term,
                installed: false,
            });
        }

        volatile.last_heartbeat = Instant::now();
        volatile.leader_id = Some(request.leader_id.clone());

        if request.last_included_index <= volatile.last_applied {
            // Already covered; nothing to install.
            return Ok(InstallSnapshotResponse {
                term: persistent.current_term,
                installed: true,
            });
        }

        let snapshot = Snapshot::decode(&request.data)?;
        tracing::info!(
            index = %request.last_included_index,
            term = %request.last_included_term,
            "Queued snapshot from leader for install"
        );
        volatile.pending_snapshot = Some(snapshot);

        Ok(InstallSnapshotResponse {
            term: persistent.current_term,
            installed: true,
        })
    }

    fn step_down_inner(
        &self,
        persistent: &mut PersistentState,
        volatile: &mut VolatileState,
        new_term: Term,
    ) {
        persistent.current_term = new_term;
        persistent.voted_for = None;
        volatile.role = Role::Follower;
        volatile.leader_state = None;
        volatile.last_heartbeat = Instant::now();
    }

    /// True if the election timeout elapsed (non-leaders only).
    pub fn election_timeout_elapsed(&self) -> bool {
        let volatile = self.volatile.read();
        if volatile.role == Role::Leader {
            return false;
        }
        volatile.last_heartbeat.elapsed() > self.config.random_election_timeout()
    }

    /// Become candidate: bump term, vote for self.
    pub async fn start_election(&self) -> Result<Term> {
        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        persistent.current_term = persistent.current_term.next();
        let term = persistent.current_term;
        persistent.voted_for = Some(self.node_id.clone());

        volatile.role = Role::Candidate;
        volatile.leader_state = None;
        volatile.last_heartbeat = Instant::now();

        Ok(term)
    }

    /// Become leader after winning an election.
    pub async fn become_leader(&self) -> Result<()> {
        let last_log_index = self.log.last_index().await;

        let mut volatile = self.volatile.write();
        volatile.role = Role::Leader;
        volatile.leader_id = Some(self.node_id.clone());

        let peers = volatile.members.peers_of(&self.node_id);
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for node in peers {
            next_index.insert(node.clone(), last_log_index.next());
            match_index.insert(node, LogIndex::ZERO);
        }

        volatile.leader_state = Some(LeaderState {
            next_index,
            match_index,
            last_ack: HashMap::new(),
            since: Instant::now(),
        });

        let term = self.persistent.read().current_term;
        drop(volatile);

        tracing::info!(term = %term, node = %self.node_id, "Became leader");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_state() -> (RaftState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();

        let members = ClusterMembers::new(vec![
            NodeId::new("b1"),
            NodeId::new("b2"),
            NodeId::new("b3"),
        ]);

        let state = RaftState::new(NodeId::new("b1"), RaftConfig::default(), log, members);
        (state, temp_dir)
    }

    #[tokio::test]
    async fn initial_state_is_follower() {
        let (state, _temp) = create_test_state().await;

        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.current_term(), Term::ZERO);
        assert_eq!(state.leader(), None);
    }

    #[tokio::test]
    async fn request_vote_grants_for_fresh_candidate() {
        let (state, _temp) = create_test_state().await;

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: NodeId::new("b2"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        let response = state.handle_request_vote(request).await.unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, Term(5));
    }

    #[tokio::test]
    async fn request_vote_rejects_stale_term() {
        let (state, _temp) = create_test_state().await;
        state.set_current_term(Term(10));

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: NodeId::new("b2"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        let response = state.handle_request_vote(request).await.unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, Term(10));
    }

    #[tokio::test]
    async fn request_vote_rejects_outdated_log() {
        let (state, _temp) = create_test_state().await;
        state
            .log_ref()
            .append(LogEntry::new(
                Term(3),
                LogIndex(1),
                bytes::Bytes::from("x"),
            ))
            .await
            .unwrap();

        let request = RequestVoteRequest {
            term: Term(4),
            candidate_id: NodeId::new("b2"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term(2), // behind our last term
        };

        let response = state.handle_request_vote(request).await.unwrap();
        assert!(!response.vote_granted);
    }

    #[tokio::test]
    async fn append_entries_heartbeat_adopts_leader() {
        let (state, _temp) = create_test_state().await;

        let request = AppendEntriesRequest {
            term: Term(1),
            leader_id: NodeId::new("b2"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };

        let response = state.handle_append_entries(request).await.unwrap();
        assert!(response.success);
        assert_eq!(state.leader(), Some(NodeId::new("b2")));
    }

    #[tokio::test]
    async fn append_entries_detects_conflict() {
        let (state, _temp) = create_test_state().await;
        state.set_current_term(Term(2));

        let request = AppendEntriesRequest {
            term: Term(2),
            leader_id: NodeId::new("b2"),
            prev_log_index: LogIndex(5), // we have nothing at index 5
            prev_log_term: Term(2),
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };

        let response = state.handle_append_entries(request).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(LogIndex(4)));
    }

    #[tokio::test]
    async fn append_entries_advances_commit_index() {
        let (state, _temp) = create_test_state().await;

        let entries = vec![
            LogEntry::new(Term(1), LogIndex(1), bytes::Bytes::from("a")),
            LogEntry::new(Term(1), LogIndex(2), bytes::Bytes::from("b")),
        ];

        let request = AppendEntriesRequest {
            term: Term(1),
            leader_id: NodeId::new("b2"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries,
            leader_commit: LogIndex(2),
        };

        let response = state.handle_append_entries(request).await.unwrap();
        assert!(response.success);
        assert_eq!(state.commit_index(), LogIndex(2));
    }

    #[tokio::test]
    async fn start_election_increments_term() {
        let (state, _temp) = create_test_state().await;

        let initial = state.current_term();
        let new_term = state.start_election().await.unwrap();

        assert_eq!(new_term, initial.next());
        assert_eq!(state.role(), Role::Candidate);
    }

    #[tokio::test]
    async fn mark_applied_wakes_watchers() {
        let (state, _temp) = create_test_state().await;
        let mut rx = state.applied_watch();

        state.mark_applied(LogIndex(3));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);
        assert_eq!(state.last_applied(), LogIndex(3));
    }
}
