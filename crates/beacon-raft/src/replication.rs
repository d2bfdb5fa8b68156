//! Log replication and the sequential apply path.
//!
//! The leader replicates entries (or empty heartbeats) to every follower
//! each heartbeat interval, advancing the commit index once a majority
//! acknowledges. A single apply loop then feeds committed entries to the
//! state machine in strict log order; it is the only writer of
//! replicated state.

use crate::config::RaftConfig;
use crate::error::Result;
use crate::snapshot::{SnapshotStore, StateMachine};
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};

/// Replicate to one follower.
///
/// Sends entries from `next_index[follower]`, or the newest snapshot if
/// that index has been compacted away. Updates next/match indexes from
/// the response. Returns true when the follower acknowledged.
pub async fn replicate_to_follower(
    state: Arc<RaftState>,
    config: &RaftConfig,
    follower: &NodeId,
    transport: Arc<dyn RaftTransport>,
    snapshots: Option<&SnapshotStore>,
) -> Result<bool> {
    let (next_idx, last_snapshot_index) = {
        let volatile = state.volatile_state().read();
        let leader_state = volatile
            .leader_state
            .as_ref()
            .ok_or_else(|| crate::error::RaftError::Internal {
                reason: "Not leader".to_string(),
            })?;
        let next_idx = leader_state
            .next_index
            .get(follower)
            .copied()
            .unwrap_or(LogIndex(1));
        (next_idx, volatile.last_snapshot_index)
    };

    // Follower is behind the compaction point: ship the snapshot instead.
    let first_live = state.log_ref().first_index().await;
    if next_idx <= last_snapshot_index && (first_live == LogIndex::ZERO || next_idx < first_live) {
        return send_snapshot(state, follower, transport, snapshots).await;
    }

    let prev_log_index = next_idx.prev().unwrap_or(LogIndex::ZERO);
    let prev_log_term = if prev_log_index == LogIndex::ZERO {
        Term::ZERO
    } else {
        state
            .log_ref()
            .get(prev_log_index)
            .await?
            .map(|e| e.term)
            .unwrap_or(Term::ZERO)
    };

    let last_log_index = state.log_ref().last_index().await;
    let mut entries = if next_idx <= last_log_index {
        state
            .log_ref()
            .get_range(next_idx, last_log_index.next())
            .await?
    } else {
        Vec::new() // heartbeat
    };
    entries.truncate(config.max_entries_per_append);

    let current_term = state.current_term();
    let leader_commit = state.commit_index();

    let request = AppendEntriesRequest {
        term: current_term,
        leader_id: state.node_id().clone(),
        prev_log_index,
        prev_log_term,
        entries: entries.clone(),
        leader_commit,
    };

    match transport.append_entries(follower, request).await {
        Ok(response) => {
            if response.term > current_term {
                // Stale leadership; the next incoming RPC will step us down.
                return Ok(false);
            }

            let mut volatile = state.volatile_state().write();
            if let Some(leader_state) = volatile.leader_state.as_mut() {
                leader_state.last_ack.insert(follower.clone(), Instant::now());

                if response.success {
                    let new_match_index = if entries.is_empty() {
                        prev_log_index
                    } else {
                        entries[entries.len() - 1].index
                    };

                    leader_state
                        .next_index
                        .insert(follower.clone(), new_match_index.next());
                    leader_state
                        .match_index
                        .insert(follower.clone(), new_match_index);

                    Ok(true)
                } else {
                    let new_next_index = response
                        .conflict_index
                        .unwrap_or_else(|| next_idx.prev().unwrap_or(LogIndex(1)));

                    leader_state
                        .next_index
                        .insert(follower.clone(), new_next_index);

                    Ok(false)
                }
            } else {
                Ok(false) // no longer leader
            }
        }
        Err(_) => {
            // Unreachable this round; retried on the next heartbeat.
            Ok(false)
        }
    }
}

/// Send the newest snapshot to a follower behind the compaction point.
async fn send_snapshot(
    state: Arc<RaftState>,
    follower: &NodeId,
    transport: Arc<dyn RaftTransport>,
    snapshots: Option<&SnapshotStore>,
) -> Result<bool> {
    let Some(store) = snapshots else {
        tracing::warn!(
            follower = %follower,
            "Follower behind compaction point but no snapshot store configured"
        );
        return Ok(false);
    };

    let Some(snapshot) = store.load_latest()? else {
        tracing::warn!(follower = %follower, "No snapshot available to catch follower up");
        return Ok(false);
    };

    let current_term = state.current_term();
    let request = InstallSnapshotRequest {
        term: current_term,
        leader_id: state.node_id().clone(),
        last_included_index: snapshot.metadata.last_included_index,
        last_included_term: snapshot.metadata.last_included_term,
        data: snapshot.encode()?,
    };
    let snap_index = snapshot.metadata.last_included_index;

    match transport.install_snapshot(follower, request).await {
        Ok(response) if response.installed && response.term <= current_term => {
            let mut volatile = state.volatile_state().write();
            if let Some(leader_state) = volatile.leader_state.as_mut() {
                leader_state.last_ack.insert(follower.clone(), Instant::now());
                leader_state
                    .next_index
                    .insert(follower.clone(), snap_index.next());
                leader_state.match_index.insert(follower.clone(), snap_index);
            }
            tracing::info!(follower = %follower, index = %snap_index, "Follower caught up via snapshot");
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(_) => Ok(false),
    }
}

/// Advance the commit index from follower match indexes.
///
/// Commits the highest N replicated on a majority whose entry carries the
/// current term, the standard rule that avoids committing stale-term
/// entries by counting.
pub async fn advance_commit_index(state: Arc<RaftState>) -> Result<bool> {
    let current_term = state.current_term();
    let current_commit = state.commit_index();
    let last_log_index = state.log_ref().last_index().await;

    let match_indices = {
        let volatile = state.volatile_state().read();
        if let Some(leader_state) = &volatile.leader_state {
            let mut indices: Vec<LogIndex> = leader_state.match_index.values().copied().collect();
            indices.push(last_log_index); // our own log
            indices
        } else {
            return Ok(false);
        }
    };

    let mut candidates: Vec<LogIndex> = match_indices
        .iter()
        .filter(|&&idx| idx > current_commit)
        .copied()
        .collect();

    if candidates.is_empty() {
        return Ok(false);
    }

    candidates.sort_by(|a, b| b.cmp(a));
    let quorum = (match_indices.len() / 2) + 1;

    for candidate in candidates {
        let count = match_indices.iter().filter(|&&idx| idx >= candidate).count();
        if count >= quorum {
            if let Some(entry) = state.log_ref().get(candidate).await? {
                if entry.term == current_term {
                    let mut volatile = state.volatile_state().write();
                    if candidate > volatile.commit_index {
                        volatile.commit_index = candidate;
                    }
                    return Ok(true);
                }
            }
        }
    }

    Ok(false)
}

/// One replication round: all followers in parallel, then try to commit.
///
/// No-op unless this node is leader.
pub async fn replicate_round(
    state: Arc<RaftState>,
    config: &RaftConfig,
    transport: Arc<dyn RaftTransport>,
    snapshots: Option<&SnapshotStore>,
) {
    if state.role() != Role::Leader {
        return;
    }

    let followers = {
        let volatile = state.volatile_state().read();
        volatile.members.peers_of(state.node_id())
    };

    let mut futures = Vec::new();
    for follower in followers {
        let state = state.clone();
        let transport = transport.clone();
        futures.push(async move {
            replicate_to_follower(state, config, &follower, transport, snapshots).await
        });
    }

    let _ = futures::future::join_all(futures).await;
    let _ = advance_commit_index(state).await;
}

/// Leader heartbeat loop: a replication round every interval.
pub async fn heartbeat_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    snapshots: Arc<SnapshotStore>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                replicate_round(
                    state.clone(),
                    &config,
                    transport.clone(),
                    Some(snapshots.as_ref()),
                )
                .await;
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Heartbeat loop shutting down");
                break;
            }
        }
    }
}

/// Sequential apply loop: the single writer of replicated state.
///
/// Installs any pending snapshot first, then applies committed entries in
/// order. A committed index whose entry is missing or out of sequence is
/// a detected log divergence: fatal, reported on `fatal_tx`, loop stops.
/// A command the state machine rejects (malformed payload that somehow
/// committed) is logged and skipped; it must not halt the apply path.
pub async fn apply_loop(
    state: Arc<RaftState>,
    state_machine: Arc<tokio::sync::Mutex<dyn StateMachine>>,
    fatal_tx: tokio::sync::broadcast::Sender<String>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_millis(10));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(reason) = apply_pending(&state, &state_machine).await {
                    tracing::error!(%reason, "Apply path stopped: log divergence detected");
                    let _ = fatal_tx.send(reason);
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Apply loop shutting down");
                break;
            }
        }
    }
}

/// Install a pending snapshot and/or apply newly committed entries.
///
/// Returns Err(reason) only on divergence.
async fn apply_pending(
    state: &Arc<RaftState>,
    state_machine: &Arc<tokio::sync::Mutex<dyn StateMachine>>,
) -> std::result::Result<(), String> {
    // Snapshot install takes priority; it moves last_applied forward.
    let pending = state.volatile_state().write().pending_snapshot.take();
    if let Some(snapshot) = pending {
        let snap_index = snapshot.metadata.last_included_index;
        {
            let mut sm = state_machine.lock().await;
            if let Err(e) = sm.restore(&snapshot.data) {
                // A bad snapshot must not corrupt the state machine.
                tracing::error!(error = %e, index = %snap_index, "Snapshot restore failed");
                return Ok(());
            }
        }
        {
            let mut volatile = state.volatile_state().write();
            if snap_index > volatile.commit_index {
                volatile.commit_index = snap_index;
            }
            volatile.last_snapshot_index = snap_index;
        }
        if let Err(e) = state.log_ref().compact(snap_index).await {
            tracing::warn!(error = %e, "Log compaction after snapshot install failed");
        }
        state.mark_applied(snap_index);
        tracing::info!(index = %snap_index, "Installed snapshot");
    }

    let (last_applied, commit_index) = {
        let volatile = state.volatile_state().read();
        (volatile.last_applied, volatile.commit_index)
    };

    if commit_index <= last_applied {
        return Ok(());
    }

    let entries = match state
        .log_ref()
        .get_range(last_applied.next(), commit_index.next())
        .await
    {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read committed entries");
            return Ok(());
        }
    };

    let mut expected = last_applied.next();
    if entries.is_empty() {
        return Err(format!(
            "committed entries [{}, {}] missing from log",
            expected, commit_index
        ));
    }

    for entry in entries {
        if entry.index != expected {
            return Err(format!(
                "log gap at {} (expected {})",
                entry.index, expected
            ));
        }
        expected = expected.next();

        {
            let mut sm = state_machine.lock().await;
            if let Err(e) = sm.apply(entry.index, &entry.command) {
                tracing::error!(
                    error = %e,
                    index = %entry.index,
                    "State machine rejected committed command, skipping"
                );
            }
        }
        state.mark_applied(entry.index);
    }

    Ok(())
}
