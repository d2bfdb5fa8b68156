//! Broker health reporting.

use crate::broker::BrokerCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Aggregated health snapshot of one broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHealth {
    /// "healthy", "degraded", or "no_leader"
    pub status: String,

    pub node_id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,

    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,

    /// Member liveness as observed from this broker.
    pub members: BTreeMap<String, String>,

    pub registered_services: usize,
    pub connected_agents: usize,
    pub local_connected_clients: usize,
}

/// Health check service for a broker.
pub struct HealthChecker {
    core: Arc<BrokerCore>,
}

impl HealthChecker {
    pub fn new(core: Arc<BrokerCore>) -> Self {
        Self { core }
    }

    pub fn check(&self) -> BrokerHealth {
        let metrics = self.core.cluster_metrics();

        let status = if metrics.leader_id.is_none() {
            "no_leader"
        } else if metrics.commit_index > metrics.applied_index {
            "degraded"
        } else {
            "healthy"
        };

        BrokerHealth {
            status: status.to_string(),
            node_id: self.core.node_id().to_string(),
            is_leader: self.core.is_leader(),
            leader_id: metrics.leader_id,
            term: self.core.current_term(),
            commit_index: metrics.commit_index,
            applied_index: metrics.applied_index,
            members: metrics.node_status,
            registered_services: metrics.registered_services,
            connected_agents: metrics.connected_agents,
            local_connected_clients: metrics.local_connected_clients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use beacon_raft::transport::{InMemoryTransport, RaftTransport};
    use beacon_raft::NodeId;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn healthy_single_node_broker() {
        let dir = TempDir::new().unwrap();
        let yaml = format!("node_id: \"b1\"\ndata_dir: \"{}\"\n", dir.path().display());
        let config: BrokerConfig = serde_yaml::from_str(&yaml).unwrap();

        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("b1"), HashMap::new()));
        let core = BrokerCore::new(config, transport, None).await.unwrap();
        core.start().await.unwrap();

        for _ in 0..100 {
            if core.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let health = HealthChecker::new(core.clone()).check();
        assert_eq!(health.status, "healthy");
        assert!(health.is_leader);
        assert_eq!(health.leader_id, Some("b1".to_string()));
        assert!(health.term >= 1);
        assert_eq!(health.node_id, "b1");

        core.shutdown();
    }
}
