//! Transport abstraction for broker-to-broker consensus RPC.
//!
//! The wire protocol lives outside this crate; consensus only sees the
//! `RaftTransport` trait. Production deployments plug in a network
//! transport, tests use `InMemoryTransport` over local channels.

use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;

/// Transport for consensus RPCs.
///
/// Implementations own connection management, serialization, and network
/// failure handling. All calls are async and may take network-scale time.
/// NodeId is opaque here; the transport resolves it to a real address.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send RequestVote to a peer during an election.
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries to a peer (heartbeat or replication).
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send InstallSnapshot to a peer that has fallen behind compaction.
    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// RPC envelope delivered to a node's handler loop.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: tokio::sync::oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: tokio::sync::oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: tokio::sync::oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = tokio::sync::mpsc::Sender<RpcMessage>;
pub type RpcReceiver = tokio::sync::mpsc::Receiver<RpcMessage>;

/// In-memory transport for tests (local channels, no network).
///
/// Lets multi-broker clusters run in one process: each node owns an
/// `RpcReceiver` and peers hold the matching senders.
pub struct InMemoryTransport {
    local_id: NodeId,
    peers: std::sync::Arc<parking_lot::RwLock<std::collections::HashMap<NodeId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(local_id: NodeId, peers: std::collections::HashMap<NodeId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: std::sync::Arc::new(parking_lot::RwLock::new(peers)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    /// Remove a peer, simulating an unreachable node.
    pub fn remove_peer(&self, peer_id: &NodeId) {
        self.peers.write().remove(peer_id);
    }

    fn get_peer(&self, peer_id: &NodeId) -> Result<RpcSender> {
        self.peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| crate::error::RaftError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("peer not found: {peer_id}"),
                ),
            })
    }

    async fn round_trip<Req, Resp>(
        &self,
        target: &NodeId,
        make: impl FnOnce(Req, tokio::sync::oneshot::Sender<Resp>) -> RpcMessage,
        request: Req,
    ) -> Result<Resp> {
        let peer = self.get_peer(target)?;
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        peer.send(make(request, response_tx))
            .await
            .map_err(|e| crate::error::RaftError::Io {
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()),
            })?;
        response_rx.await.map_err(|e| crate::error::RaftError::Io {
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()),
        })
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.round_trip(
            target,
            |request, response_tx| RpcMessage::RequestVote {
                request,
                response_tx,
            },
            request,
        )
        .await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.round_trip(
            target,
            |request, response_tx| RpcMessage::AppendEntries {
                request,
                response_tx,
            },
            request,
        )
        .await
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.round_trip(
            target,
            |request, response_tx| RpcMessage::InstallSnapshot {
                request,
                response_tx,
            },
            request,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn in_memory_request_vote_round_trip() {
        let (tx1, mut rx1) = tokio::sync::mpsc::channel(10);

        let mut peers = HashMap::new();
        peers.insert(NodeId::new("b1"), tx1);

        let transport = InMemoryTransport::new(NodeId::new("b2"), peers);

        tokio::spawn(async move {
            if let Some(RpcMessage::RequestVote { response_tx, .. }) = rx1.recv().await {
                let _ = response_tx.send(RequestVoteResponse {
                    term: Term(5),
                    vote_granted: true,
                });
            }
        });

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: NodeId::new("b2"),
            last_log_index: LogIndex(10),
            last_log_term: Term(4),
        };

        let response = transport
            .request_vote(&NodeId::new("b1"), request)
            .await
            .unwrap();
        assert_eq!(response.term, Term(5));
        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn in_memory_unknown_peer_errors() {
        let transport = InMemoryTransport::new(NodeId::new("b1"), HashMap::new());

        let request = RequestVoteRequest {
            term: Term(1),
            candidate_id: NodeId::new("b1"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        let response = transport.request_vote(&NodeId::new("nope"), request).await;
        assert!(matches!(
            response.unwrap_err(),
            crate::error::RaftError::Io { .. }
        ));
    }

    #[tokio::test]
    async fn removed_peer_becomes_unreachable() {
        let (tx1, _rx1) = tokio::sync::mpsc::channel(10);
        let mut peers = HashMap::new();
        peers.insert(NodeId::new("b1"), tx1);

        let transport = InMemoryTransport::new(NodeId::new("b2"), peers);
        transport.remove_peer(&NodeId::new("b1"));

        let request = AppendEntriesRequest {
            term: Term(1),
            leader_id: NodeId::new("b2"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };

        assert!(transport
            .append_entries(&NodeId::new("b1"), request)
            .await
            .is_err());
    }
}
