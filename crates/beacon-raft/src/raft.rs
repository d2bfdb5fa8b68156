//! Consensus module composition: wires state, log, transport, and the
//! background loops together.
//!
//! `Raft` owns the lifecycle:
//! - recovery from the newest snapshot on start
//! - election timer + election loop
//! - heartbeat/replication loop (active only while leader)
//! - sequential apply loop driving the state machine
//! - snapshot loop (interval or entry-count triggered, reconfigurable)
//! - RPC handler loop for incoming messages

use crate::config::{RaftConfig, SnapshotPolicy};
use crate::election::election_loop;
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::replication::{apply_loop, heartbeat_loop};
use crate::rpc_handler::rpc_handler_loop;
use crate::snapshot::{Snapshot, SnapshotStore, StateMachine};
use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use crate::ReplicatedLog;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::interval;

/// The consensus module for one broker node.
pub struct Raft {
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,

    election_timer: Arc<ElectionTimer>,
    timeout_rx: Mutex<Option<mpsc::Receiver<()>>>,

    shutdown_tx: broadcast::Sender<()>,

    /// Fatal-condition channel (log divergence); consumers should stop
    /// the broker process when this fires.
    fatal_tx: broadcast::Sender<String>,

    state_machine: Arc<Mutex<dyn StateMachine>>,
    snapshots: Arc<SnapshotStore>,
    snapshot_policy: Arc<RwLock<SnapshotPolicy>>,

    rpc_rx: Mutex<Option<RpcReceiver>>,
}

impl Raft {
    /// Create a new consensus module.
    ///
    /// `rpc_rx` carries incoming RPCs from the transport; pass `None` for
    /// a node that will never receive (single-node setups in tests).
    pub fn new(
        node_id: NodeId,
        config: RaftConfig,
        log: RaftLog,
        transport: Arc<dyn RaftTransport>,
        members: ClusterMembers,
        state_machine: Arc<Mutex<dyn StateMachine>>,
        snapshots: SnapshotStore,
        rpc_rx: Option<RpcReceiver>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::ConfigError { reason })?;

        let state = Arc::new(RaftState::new(
            node_id,
            config.clone(),
            log,
            members,
        ));

        let (election_timer, timeout_rx) = ElectionTimer::new(config.clone());
        let (shutdown_tx, _) = broadcast::channel(16);
        let (fatal_tx, _) = broadcast::channel(4);
        let snapshot_policy = Arc::new(RwLock::new(config.snapshot.clone()));

        Ok(Self {
            state,
            config,
            transport,
            election_timer: Arc::new(election_timer),
            timeout_rx: Mutex::new(Some(timeout_rx)),
            shutdown_tx,
            fatal_tx,
            state_machine,
            snapshots: Arc::new(snapshots),
            snapshot_policy,
            rpc_rx: Mutex::new(rpc_rx),
        })
    }

    /// Recover from the newest snapshot, then spawn all background loops.
    pub async fn start(&self) -> Result<()> {
        self.recover().await?;

        let timer = self.election_timer.clone();
        tokio::spawn(timer.run());

        let timeout_rx = self
            .timeout_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RaftError::Internal {
                reason: "Raft already started".to_string(),
            })?;

        tokio::spawn(election_loop(
            self.state.clone(),
            self.config.clone(),
            self.transport.clone(),
            timeout_rx,
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(heartbeat_loop(
            self.state.clone(),
            self.config.clone(),
            self.transport.clone(),
            self.snapshots.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(apply_loop(
            self.state.clone(),
            self.state_machine.clone(),
            self.fatal_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(snapshot_loop(
            self.state.clone(),
            self.state_machine.clone(),
            self.snapshots.clone(),
            self.snapshot_policy.clone(),
            self.shutdown_tx.subscribe(),
        ));

        if let Some(rpc_rx) = self.rpc_rx.lock().await.take() {
            tokio::spawn(rpc_handler_loop(
                self.state.clone(),
                rpc_rx,
                self.election_timer.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }

        Ok(())
    }

    /// Restore the state machine from the newest snapshot on disk.
    ///
    /// Entries after the snapshot stay in the log and are re-applied once
    /// commitment is re-established through the cluster; deterministic
    /// replay yields the exact pre-restart state.
    async fn recover(&self) -> Result<()> {
        let Some(snapshot) = self.snapshots.load_latest()? else {
            return Ok(());
        };

        let snap_index = snapshot.metadata.last_included_index;
        {
            let mut sm = self.state_machine.lock().await;
            sm.restore(&snapshot.data)?;
        }
        {
            let mut volatile = self.state.volatile_state().write();
            volatile.commit_index = snap_index;
            volatile.last_snapshot_index = snap_index;
        }
        self.state.log_ref().compact(snap_index).await?;
        self.state.mark_applied(snap_index);

        tracing::info!(index = %snap_index, "Recovered from snapshot");
        Ok(())
    }

    /// Stop all background loops.
    pub fn shutdown(&self) {
        self.election_timer.shutdown();
        let _ = self.shutdown_tx.send(());
    }

    /// Subscribe to fatal conditions (detected log divergence).
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }

    /// Replace the snapshot policy at runtime.
    pub fn configure_snapshots(&self, policy: SnapshotPolicy) {
        tracing::info!(?policy, "Snapshot policy reconfigured");
        *self.snapshot_policy.write() = policy;
    }

    /// Current snapshot policy.
    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        self.snapshot_policy.read().clone()
    }

    /// Take a snapshot of the current applied state immediately.
    ///
    /// Used by the snapshot loop and by tests; returns the snapshot that
    /// was saved, or None when there is nothing new to snapshot.
    pub async fn create_snapshot(&self) -> Result<Option<Snapshot>> {
        let policy = self.snapshot_policy.read().clone();
        take_snapshot(&self.state, &self.state_machine, &self.snapshots, &policy).await
    }

    pub fn node_id(&self) -> &NodeId {
        self.state.node_id()
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.state.last_applied()
    }

    pub fn leader_uptime(&self) -> Option<Duration> {
        self.state.leader_uptime()
    }

    pub fn peer_status(&self) -> HashMap<NodeId, PeerStatus> {
        self.state.peer_status()
    }
}

#[async_trait::async_trait]
impl ReplicatedLog for Raft {
    /// Propose a command and wait until it is applied.
    ///
    /// Acknowledgment is post-commit: a returned index means the command
    /// is durable on a majority and reflected in this node's state. A
    /// timeout means the outcome is unknown (the command may still
    /// commit), so callers must treat retries as upserts/idempotent.
    async fn propose(&self, cmd: Bytes) -> Result<LogIndex> {
        if self.state.role() != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.state.leader(),
            });
        }

        let term = self.state.current_term();
        let index = self.state.log_ref().last_index().await.next();
        let entry = LogEntry::new(term, index, cmd);
        self.state.log_ref().append(entry).await?;

        // Wait for the apply loop to reach our index.
        let mut applied_rx = self.state.applied_watch();
        let started = Instant::now();
        let deadline = self.config.propose_timeout;

        loop {
            if *applied_rx.borrow_and_update() >= index.as_u64() {
                break;
            }
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(RaftError::CommitTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            match tokio::time::timeout(remaining, applied_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(RaftError::Internal {
                        reason: "applied watch closed".to_string(),
                    })
                }
                Err(_) => {
                    return Err(RaftError::CommitTimeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }

        // The index was applied, but our entry may have been replaced by
        // another leader's. It only counts if the term survived.
        match self.state.log_ref().get(index).await? {
            Some(entry) if entry.term == term => Ok(index),
            Some(_) => Err(RaftError::NotLeader {
                leader: self.state.leader(),
            }),
            None => {
                // Compacted already; ours iff we are still leading the
                // same term.
                if self.state.role() == Role::Leader && self.state.current_term() == term {
                    Ok(index)
                } else {
                    Err(RaftError::NotLeader {
                        leader: self.state.leader(),
                    })
                }
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    fn leader(&self) -> Option<NodeId> {
        self.state.leader()
    }
}

/// Background snapshot loop.
///
/// Checks the policy every second and snapshots when the interval has
/// elapsed or enough entries have been applied since the last snapshot.
async fn snapshot_loop(
    state: Arc<RaftState>,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    snapshots: Arc<SnapshotStore>,
    policy: Arc<RwLock<SnapshotPolicy>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut last_taken = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pol = policy.read().clone();
                let (applied, snap_index) = {
                    let volatile = state.volatile_state().read();
                    (volatile.last_applied, volatile.last_snapshot_index)
                };

                let entries_since = applied.as_u64().saturating_sub(snap_index.as_u64());
                let due = applied > snap_index
                    && (last_taken.elapsed() >= pol.interval
                        || entries_since >= pol.entry_threshold);

                if due {
                    match take_snapshot(&state, &state_machine, &snapshots, &pol).await {
                        Ok(Some(_)) => last_taken = Instant::now(),
                        Ok(None) => {}
                        Err(e) => tracing::error!(error = %e, "Snapshot failed"),
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Snapshot loop shutting down");
                break;
            }
        }
    }
}

/// Serialize the applied state, save it, prune old files, compact the log.
async fn take_snapshot(
    state: &Arc<RaftState>,
    state_machine: &Arc<Mutex<dyn StateMachine>>,
    snapshots: &Arc<SnapshotStore>,
    policy: &SnapshotPolicy,
) -> Result<Option<Snapshot>> {
    let (applied, snap_index) = {
        let volatile = state.volatile_state().read();
        (volatile.last_applied, volatile.last_snapshot_index)
    };
    if applied <= snap_index {
        return Ok(None);
    }

    let term = state
        .log_ref()
        .get(applied)
        .await?
        .map(|e| e.term)
        .unwrap_or_else(|| state.current_term());

    let data = {
        let sm = state_machine.lock().await;
        sm.snapshot()?
    };

    let snapshot = Snapshot::new(applied, term, policy.compress, data);
    snapshots.save(&snapshot)?;
    snapshots.prune(policy.retention_count)?;

    state.log_ref().compact(applied).await?;
    state.volatile_state().write().last_snapshot_index = applied;

    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use tempfile::TempDir;

    struct NullSm;

    impl StateMachine for NullSm {
        fn apply(&mut self, _index: LogIndex, _command: &[u8]) -> Result<()> {
            Ok(())
        }
        fn snapshot(&self) -> Result<Bytes> {
            Ok(Bytes::from_static(b"null"))
        }
        fn restore(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    async fn create_test_raft(members: Vec<&str>) -> (Raft, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path().join("log")).await.unwrap();
        let snapshots = SnapshotStore::open(temp_dir.path().join("snapshots")).unwrap();

        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(
            NodeId::new("b1"),
            HashMap::new(),
        ));

        let members = ClusterMembers::new(members.into_iter().map(NodeId::new).collect());
        let sm: Arc<Mutex<dyn StateMachine>> = Arc::new(Mutex::new(NullSm));

        let raft = Raft::new(
            NodeId::new("b1"),
            RaftConfig::default(),
            log,
            transport,
            members,
            sm,
            snapshots,
            None,
        )
        .unwrap();
        (raft, temp_dir)
    }

    #[tokio::test]
    async fn new_raft_is_follower() {
        let (raft, _temp) = create_test_raft(vec!["b1", "b2", "b3"]).await;
        assert!(!raft.is_leader());
        assert_eq!(raft.leader(), None);
    }

    #[tokio::test]
    async fn propose_rejected_when_not_leader() {
        let (raft, _temp) = create_test_raft(vec!["b1", "b2", "b3"]).await;

        let result = raft.propose(Bytes::from("cmd")).await;
        assert!(matches!(result, Err(RaftError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn single_node_proposes_and_applies() {
        let (raft, _temp) = create_test_raft(vec!["b1"]).await;
        raft.start().await.unwrap();

        // A single-member cluster elects itself.
        let mut elected = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if raft.is_leader() {
                elected = true;
                break;
            }
        }
        assert!(elected, "single node should elect itself");

        let index = raft.propose(Bytes::from("cmd")).await.unwrap();
        assert_eq!(index, LogIndex(1));
        assert_eq!(raft.applied_index(), LogIndex(1));

        raft.shutdown();
    }

    #[tokio::test]
    async fn configure_snapshots_replaces_policy() {
        let (raft, _temp) = create_test_raft(vec!["b1"]).await;

        let mut policy = SnapshotPolicy::default();
        policy.retention_count = 7;
        policy.compress = true;
        raft.configure_snapshots(policy.clone());

        assert_eq!(raft.snapshot_policy(), policy);
    }

    #[tokio::test]
    async fn start_shutdown_is_clean() {
        let (raft, _temp) = create_test_raft(vec!["b1", "b2", "b3"]).await;
        raft.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        raft.shutdown();
    }
}
