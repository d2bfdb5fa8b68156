//! Leader election.
//!
//! Followers turn candidate when the election timer fires, request votes
//! from all peers in parallel, and need a majority to lead. Randomized
//! timeouts keep split votes from repeating.

use crate::config::RaftConfig;
use crate::error::Result;
use crate::replication;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;

/// Outcome of one election attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Won: became leader.
    Won { term: Term, votes_received: usize },

    /// Lost: discovered a higher term or another leader.
    Lost { current_term: Term },

    /// No majority either way (split vote); retry on next timeout.
    Timeout,
}

/// Run one election as a candidate.
pub async fn run_election(
    state: Arc<RaftState>,
    config: &RaftConfig,
    transport: Arc<dyn RaftTransport>,
) -> Result<ElectionOutcome> {
    let term = state.start_election().await?;

    let members = state.volatile_state().read().members.clone();
    let node_id = state.node_id().clone();

    let mut votes_received = HashSet::new();
    votes_received.insert(node_id.clone());

    let last_log_index = state.log_ref().last_index().await;
    let last_log_term = state.log_ref().last_term().await;

    let mut vote_futures = Vec::new();
    for peer in members.peers_of(&node_id) {
        let transport = transport.clone();
        let request = RequestVoteRequest {
            term,
            candidate_id: node_id.clone(),
            last_log_index,
            last_log_term,
        };
        let rpc_timeout = config.election_timeout_min;

        vote_futures.push(async move {
            let result = timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
            (peer, result)
        });
    }

    let results = futures::future::join_all(vote_futures).await;

    for (peer, result) in results {
        match result {
            Ok(Ok(response)) => {
                let current_term = state.current_term();
                if current_term != term {
                    return Ok(ElectionOutcome::Lost { current_term });
                }

                if response.term > term {
                    return Ok(ElectionOutcome::Lost {
                        current_term: response.term,
                    });
                }

                if response.vote_granted {
                    votes_received.insert(peer);
                }
            }
            // RPC errors and timeouts just cost us that peer's vote.
            Ok(Err(_)) | Err(_) => continue,
        }
    }

    if members.has_quorum(&votes_received.iter().cloned().collect::<Vec<_>>()) {
        Ok(ElectionOutcome::Won {
            term,
            votes_received: votes_received.len(),
        })
    } else {
        Ok(ElectionOutcome::Timeout)
    }
}

/// Background election loop.
///
/// Waits for timer firings, runs elections, and transitions to leader on
/// a win, immediately replicating a round of heartbeats so followers
/// learn about the new leader before their own timers fire.
pub async fn election_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    mut timeout_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(_) = timeout_rx.recv() => {
                if state.role() == Role::Leader {
                    continue;
                }

                // The timer fires on wall-clock silence; double-check the
                // state actually went quiet (a vote grant also resets it).
                if !state.election_timeout_elapsed() {
                    continue;
                }

                match run_election(state.clone(), &config, transport.clone()).await {
                    Ok(ElectionOutcome::Won { term, votes_received }) => {
                        tracing::info!(
                            term = %term,
                            votes = votes_received,
                            "Won election, becoming leader"
                        );

                        if let Err(e) = state.become_leader().await {
                            tracing::error!(error = ?e, "Failed to become leader");
                            continue;
                        }

                        // Assert leadership right away.
                        replication::replicate_round(state.clone(), &config, transport.clone(), None)
                            .await;
                    }
                    Ok(ElectionOutcome::Lost { current_term }) => {
                        tracing::debug!(term = %current_term, "Lost election");
                    }
                    Ok(ElectionOutcome::Timeout) => {
                        tracing::debug!("Election split vote, will retry");
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Election error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Election loop shutting down");
                break;
            }
        }
    }
}

/// Log up-to-dateness comparison used when granting votes.
///
/// A later last term wins; equal terms compare log length.
pub fn is_log_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    our_last_term: Term,
    our_last_index: LogIndex,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}
