//! Broker configuration.
//!
//! Loaded from a YAML file or `BEACOND_*` environment variables. The
//! core only reads these values; it never invents them.
//!
//! Example:
//! ```yaml
//! node_id: "b1"
//! listen_addr: "0.0.0.0:7400"
//! data_dir: "/var/lib/beacond"
//! cluster:
//!   members:
//!     - { id: "b1", addr: "10.0.1.10:7400" }
//!     - { id: "b2", addr: "10.0.1.11:7400" }
//!     - { id: "b3", addr: "10.0.1.12:7400" }
//! raft:
//!   heartbeat_interval_ms: 150
//!   election_timeout_min_ms: 300
//!   election_timeout_max_ms: 600
//! snapshots:
//!   interval_secs: 300
//!   retention_count: 2
//!   compress: true
//! read_policy:
//!   mode: any_replica
//!   max_lag: 100
//! ```

use beacon_raft::{ClusterMembers, NodeId, RaftConfig, SnapshotPolicy};
use beacon_registry::ReadPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Unique broker identifier; must appear in `cluster.members`.
    pub node_id: String,

    /// Listen address for agent/client sessions.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory for the consensus log and snapshot files.
    pub data_dir: PathBuf,

    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub raft: RaftSection,

    #[serde(default)]
    pub snapshots: SnapshotSection,

    #[serde(default)]
    pub read_policy: ReadPolicy,

    #[serde(default)]
    pub clients: ClientSection,

    #[serde(default)]
    pub agents: AgentSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Full cluster membership, this broker included.
    #[serde(default)]
    pub members: Vec<MemberEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// How long a proposal waits for commit before reporting an unknown
    /// outcome.
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            propose_timeout_ms: default_propose_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSection {
    #[serde(default = "default_snapshot_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_snapshot_entry_threshold")]
    pub entry_threshold: u64,

    #[serde(default = "default_snapshot_retention")]
    pub retention_count: usize,

    #[serde(default)]
    pub compress: bool,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            interval_secs: default_snapshot_interval_secs(),
            entry_threshold: default_snapshot_entry_threshold(),
            retention_count: default_snapshot_retention(),
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Maximum concurrently connected local clients.
    #[serde(default = "default_max_clients")]
    pub max_connections: usize,

    /// Bound on the proposal funnel; writes beyond this fail fast.
    #[serde(default = "default_proposal_queue_depth")]
    pub proposal_queue_depth: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_clients(),
            proposal_queue_depth: default_proposal_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Expected agent heartbeat cadence.
    #[serde(default = "default_agent_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before the broker cascades the agent away.
    #[serde(default = "default_missed_threshold")]
    pub missed_heartbeat_threshold: u32,

    /// Drain window between an agent's shutdown notice and the cascade.
    #[serde(default)]
    pub shutdown_grace_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_agent_heartbeat_ms(),
            missed_heartbeat_threshold: default_missed_threshold(),
            shutdown_grace_ms: 0,
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:7400".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    150
}
fn default_election_timeout_min_ms() -> u64 {
    300
}
fn default_election_timeout_max_ms() -> u64 {
    600
}
fn default_propose_timeout_ms() -> u64 {
    5000
}
fn default_snapshot_interval_secs() -> u64 {
    300
}
fn default_snapshot_entry_threshold() -> u64 {
    10_000
}
fn default_snapshot_retention() -> usize {
    2
}
fn default_max_clients() -> usize {
    1024
}
fn default_proposal_queue_depth() -> usize {
    256
}
fn default_agent_heartbeat_ms() -> u64 {
    1000
}
fn default_missed_threshold() -> u32 {
    3
}

/// Configuration loading/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl BrokerConfig {
    /// Load from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read {path}: {e}")))?;
        let config: BrokerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("failed to parse YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables.
    ///
    /// - `BEACOND_NODE_ID`
    /// - `BEACOND_LISTEN_ADDR`
    /// - `BEACOND_DATA_DIR`
    /// - `BEACOND_MEMBERS` (comma-separated `id=host:port`)
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("BEACOND_NODE_ID")
            .map_err(|_| ConfigError::MissingField("BEACOND_NODE_ID".to_string()))?;

        let listen_addr =
            std::env::var("BEACOND_LISTEN_ADDR").unwrap_or_else(|_| default_listen_addr());

        let data_dir = std::env::var("BEACOND_DATA_DIR")
            .map_err(|_| ConfigError::MissingField("BEACOND_DATA_DIR".to_string()))?;

        let members = std::env::var("BEACOND_MEMBERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|pair| {
                        let (id, addr) = pair.trim().split_once('=').ok_or_else(|| {
                            ConfigError::Parse(format!(
                                "BEACOND_MEMBERS entry '{pair}' is not id=addr"
                            ))
                        })?;
                        Ok(MemberEntry {
                            id: id.to_string(),
                            addr: addr.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()
            })
            .transpose()?
            .unwrap_or_default();

        let config = Self {
            node_id,
            listen_addr,
            data_dir: PathBuf::from(data_dir),
            cluster: ClusterSection { members },
            raft: RaftSection::default(),
            snapshots: SnapshotSection::default(),
            read_policy: ReadPolicy::default(),
            clients: ClientSection::default(),
            agents: AgentSection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".to_string()));
        }

        if !self.cluster.members.is_empty()
            && !self.cluster.members.iter().any(|m| m.id == self.node_id)
        {
            return Err(ConfigError::Invalid(format!(
                "node_id '{}' is not in cluster.members",
                self.node_id
            )));
        }

        self.raft_config()
            .validate()
            .map_err(ConfigError::Invalid)?;

        if self.clients.proposal_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "clients.proposal_queue_depth must be > 0".to_string(),
            ));
        }

        if self.agents.missed_heartbeat_threshold == 0 {
            return Err(ConfigError::Invalid(
                "agents.missed_heartbeat_threshold must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Consensus-layer configuration derived from this file.
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(self.raft.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.raft.election_timeout_max_ms),
            max_entries_per_append: RaftConfig::default().max_entries_per_append,
            propose_timeout: Duration::from_millis(self.raft.propose_timeout_ms),
            snapshot: SnapshotPolicy {
                interval: Duration::from_secs(self.snapshots.interval_secs),
                entry_threshold: self.snapshots.entry_threshold,
                retention_count: self.snapshots.retention_count,
                compress: self.snapshots.compress,
            },
        }
    }

    /// Cluster membership; a broker with no configured peers is a
    /// single-node cluster of itself.
    pub fn members(&self) -> ClusterMembers {
        if self.cluster.members.is_empty() {
            ClusterMembers::new(vec![NodeId::new(&self.node_id)])
        } else {
            ClusterMembers::new(
                self.cluster
                    .members
                    .iter()
                    .map(|m| NodeId::new(&m.id))
                    .collect(),
            )
        }
    }

    /// NodeId → session address map, used for leader redirect hints.
    pub fn member_addrs(&self) -> HashMap<NodeId, String> {
        self.cluster
            .members
            .iter()
            .map(|m| (NodeId::new(&m.id), m.addr.clone()))
            .collect()
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn agent_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.agents.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.agents.shutdown_grace_ms)
    }
}
