//! In-process multi-broker test cluster.
#![allow(dead_code)]

use beacond::broker::BrokerCore;
use beacond::config::{
    AgentSection, BrokerConfig, ClientSection, ClusterSection, MemberEntry, RaftSection,
    SnapshotSection,
};
use beacond::local::{LocalBrokerDirectory, LocalConnector};
use beacon_raft::transport::{InMemoryTransport, RpcSender};
use beacon_raft::NodeId;
use beacon_registry::ReadPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct TestBroker {
    pub id: String,
    pub addr: String,
    pub core: Arc<BrokerCore>,
    pub _dir: TempDir,
}

pub struct TestCluster {
    pub brokers: Vec<TestBroker>,
    pub directory: LocalBrokerDirectory,
}

impl TestCluster {
    pub fn connector(&self) -> LocalConnector {
        LocalConnector::new(self.directory.clone())
    }

    pub fn addrs(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.addr.clone()).collect()
    }

    pub async fn wait_for_leader(&self) -> &TestBroker {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let leaders: Vec<&TestBroker> = self
                .brokers
                .iter()
                .filter(|b| b.core.is_leader())
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
        }
        panic!("no single leader elected");
    }

    /// Simulate a broker crash: unreachable for clients and silent toward
    /// its peers.
    pub fn kill(&self, addr: &str) {
        if let Some(core) = self.directory.remove(addr) {
            core.shutdown();
        }
    }

    pub fn shutdown(&self) {
        for broker in &self.brokers {
            broker.core.shutdown();
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init()
        .ok();
}

fn test_config(
    node_id: &str,
    addr: &str,
    members: &[(String, String)],
    dir: &TempDir,
    agents: &AgentSection,
) -> BrokerConfig {
    BrokerConfig {
        node_id: node_id.to_string(),
        listen_addr: addr.to_string(),
        data_dir: dir.path().to_path_buf(),
        cluster: ClusterSection {
            members: members
                .iter()
                .map(|(id, addr)| MemberEntry {
                    id: id.clone(),
                    addr: addr.clone(),
                })
                .collect(),
        },
        raft: RaftSection {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            propose_timeout_ms: 5000,
        },
        snapshots: SnapshotSection::default(),
        // Integration tests exercise follower reads too.
        read_policy: ReadPolicy::AnyReplica { max_lag: 1000 },
        clients: ClientSection::default(),
        agents: agents.clone(),
    }
}

/// Cluster whose agent sessions tolerate long heartbeat silence, for
/// tests that register once and never ping.
pub async fn start_cluster(size: usize) -> TestCluster {
    start_cluster_with_agents(
        size,
        AgentSection {
            heartbeat_interval_ms: 500,
            missed_heartbeat_threshold: 60,
            shutdown_grace_ms: 0,
        },
    )
    .await
}

pub async fn start_cluster_with_agents(size: usize, agents: AgentSection) -> TestCluster {
    let members: Vec<(String, String)> = (1..=size)
        .map(|i| (format!("b{i}"), format!("b{i}:7400")))
        .collect();

    let mut rpc_channels = HashMap::new();
    let mut rpc_senders: HashMap<NodeId, RpcSender> = HashMap::new();
    for (id, _) in &members {
        let (tx, rx) = mpsc::channel(100);
        rpc_channels.insert(id.clone(), rx);
        rpc_senders.insert(NodeId::new(id), tx);
    }

    let directory = LocalBrokerDirectory::new();
    let mut brokers = Vec::new();

    for (id, addr) in &members {
        let mut peers = HashMap::new();
        for (peer_id, sender) in &rpc_senders {
            if peer_id.as_str() != id {
                peers.insert(peer_id.clone(), sender.clone());
            }
        }
        let transport = Arc::new(InMemoryTransport::new(NodeId::new(id), peers));

        let dir = TempDir::new().unwrap();
        let config = test_config(id, addr, &members, &dir, &agents);
        let rpc_rx = rpc_channels.remove(id);

        let core = BrokerCore::new(config, transport, rpc_rx).await.unwrap();
        core.start().await.unwrap();

        directory.insert(addr.clone(), core.clone());
        brokers.push(TestBroker {
            id: id.clone(),
            addr: addr.clone(),
            core,
            _dir: dir,
        });
    }

    TestCluster { brokers, directory }
}
