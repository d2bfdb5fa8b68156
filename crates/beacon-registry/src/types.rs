//! Replicated registry data model.
//!
//! Everything in this module is part of `ClusterState` and therefore
//! byte-for-byte identical across replicas that have applied the same
//! index; ordered maps keep the serialized form canonical. Per-broker
//! connection state never appears here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Unique service instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        ServiceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        AgentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Draining,
    Shutdown,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Draining => write!(f, "draining"),
            AgentStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: ServiceId,

    /// Discovery name; many instances may share one name
    pub name: String,

    /// Address clients connect to
    pub address: String,

    pub metadata: BTreeMap<String, String>,

    pub health: HealthStatus,

    /// Agent whose shutdown cascades this service away
    pub owner_agent_id: AgentId,

    /// Log index of the registration that created/updated this entry
    pub registered_at_index: u64,
}

/// One registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,

    pub address: String,

    pub status: AgentStatus,

    /// Log index of the last heartbeat-refresh command for this agent
    pub last_heartbeat_index: u64,

    /// Services owned by this agent (cascade targets)
    pub service_ids: BTreeSet<ServiceId>,
}

/// The replicated registry.
///
/// Invariants:
/// - keys unique per map
/// - every `ServiceInfo.owner_agent_id` references a live agent (cascade
///   removes owner and owned services in the same apply step)
/// - `applied_index` is monotonically non-decreasing
/// - exactly one writer (the apply path) ever mutates this
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub services: BTreeMap<ServiceId, ServiceInfo>,
    pub agents: BTreeMap<AgentId, AgentInfo>,
    pub applied_index: u64,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical serialized form; equal states produce equal bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ClusterState {
        let mut state = ClusterState::new();
        let agent_id = AgentId::new("agent-1");
        let service_id = ServiceId::new("svc-1");

        state.agents.insert(
            agent_id.clone(),
            AgentInfo {
                agent_id: agent_id.clone(),
                address: "10.0.0.1:9000".to_string(),
                status: AgentStatus::Active,
                last_heartbeat_index: 1,
                service_ids: [service_id.clone()].into_iter().collect(),
            },
        );
        state.services.insert(
            service_id.clone(),
            ServiceInfo {
                service_id,
                name: "search".to_string(),
                address: "10.0.0.1:9001".to_string(),
                metadata: BTreeMap::new(),
                health: HealthStatus::Healthy,
                owner_agent_id: agent_id,
                registered_at_index: 1,
            },
        );
        state.applied_index = 1;
        state
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let a = sample_state();
        let b = sample_state();
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn canonical_bytes_differ_on_content() {
        let a = sample_state();
        let mut b = sample_state();
        b.applied_index = 2;
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }
}
