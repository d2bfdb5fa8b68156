//! Dispatcher from incoming RPC envelopes to the state handlers.
//!
//! The transport delivers `RpcMessage`s on a channel; this loop matches
//! on the message kind, invokes the matching `RaftState` handler, and
//! sends the response back through the envelope's oneshot.

use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::broadcast;

/// RPC handler loop.
///
/// Exits on shutdown signal or when the transport closes the channel.
pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    mut rpc_rx: RpcReceiver,
    election_timer: Arc<ElectionTimer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg_opt = rpc_rx.recv() => {
                match msg_opt {
                    Some(msg) => {
                        handle_rpc_message(state.clone(), election_timer.clone(), msg).await;
                    }
                    None => {
                        tracing::debug!("RPC channel closed, exiting handler loop");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("RPC handler loop shutting down");
                break;
            }
        }
    }
}

async fn handle_rpc_message(
    state: Arc<RaftState>,
    election_timer: Arc<ElectionTimer>,
    msg: RpcMessage,
) {
    match msg {
        RpcMessage::RequestVote {
            request,
            response_tx,
        } => match state.handle_request_vote(request).await {
            Ok(resp) => {
                if resp.vote_granted {
                    election_timer.reset();
                }
                let _ = response_tx.send(resp);
            }
            Err(e) => {
                // Caller times out waiting; the oneshot cannot carry errors.
                tracing::error!(error = ?e, "Failed to handle RequestVote");
            }
        },

        RpcMessage::AppendEntries {
            request,
            response_tx,
        } => match state.handle_append_entries(request).await {
            Ok(resp) => {
                if resp.success {
                    election_timer.reset();
                }
                let _ = response_tx.send(resp);
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to handle AppendEntries");
            }
        },

        RpcMessage::InstallSnapshot {
            request,
            response_tx,
        } => match state.handle_install_snapshot(request).await {
            Ok(resp) => {
                if resp.installed {
                    election_timer.reset();
                }
                let _ = response_tx.send(resp);
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to handle InstallSnapshot");
            }
        },
    }
}
