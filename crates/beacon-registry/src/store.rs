//! Read path over the replicated registry.
//!
//! The store never mutates `ClusterState`; it clones matching entries out
//! from under a read lock (copy-on-read), so readers never share a
//! mutable reference with the apply path.

use crate::types::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where reads may be served: one global policy, not per-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Only the leader answers queries (strict).
    LeaderOnly,

    /// Any replica answers, provided its applied index lags the observed
    /// commit index by at most `max_lag` entries.
    AnyReplica { max_lag: u64 },
}

impl Default for ReadPolicy {
    fn default() -> Self {
        ReadPolicy::LeaderOnly
    }
}

impl ReadPolicy {
    /// Whether this node may serve a read right now.
    pub fn permits(&self, is_leader: bool, commit_index: u64, applied_index: u64) -> bool {
        match self {
            ReadPolicy::LeaderOnly => is_leader,
            ReadPolicy::AnyReplica { max_lag } => {
                is_leader || commit_index.saturating_sub(applied_index) <= *max_lag
            }
        }
    }
}

/// Consistent reads over the live replicated state.
#[derive(Clone)]
pub struct RegistryStore {
    state: Arc<RwLock<ClusterState>>,
}

impl RegistryStore {
    /// Wrap the state handle owned by the apply path.
    pub fn new(state: Arc<RwLock<ClusterState>>) -> Self {
        Self { state }
    }

    /// Services matching `pattern`, sorted by service id.
    ///
    /// A trailing `*` makes the pattern a name prefix match; otherwise
    /// the name must match exactly.
    pub fn query(&self, pattern: &str) -> Vec<ServiceInfo> {
        let state = self.state.read();
        let matches: Vec<ServiceInfo> = match pattern.strip_suffix('*') {
            Some(prefix) => state
                .services
                .values()
                .filter(|s| s.name.starts_with(prefix))
                .cloned()
                .collect(),
            None => state
                .services
                .values()
                .filter(|s| s.name == pattern)
                .cloned()
                .collect(),
        };
        // BTreeMap iteration is already id-ordered; keep that contract
        // explicit for callers.
        matches
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<ServiceInfo> {
        self.state.read().services.get(service_id).cloned()
    }

    /// Healthy candidates sharing `name`, excluding one instance.
    ///
    /// Callers apply their own ordering (e.g. local load); the returned
    /// order is stable by service id.
    pub fn alternatives_by_name(&self, name: &str, exclude: &ServiceId) -> Vec<ServiceInfo> {
        let state = self.state.read();
        state
            .services
            .values()
            .filter(|s| {
                s.name == name && s.service_id != *exclude && s.health == HealthStatus::Healthy
            })
            .cloned()
            .collect()
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<AgentInfo> {
        self.state.read().agents.get(agent_id).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.state.read().services.len()
    }

    pub fn agent_count(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn applied_index(&self) -> u64 {
        self.state.read().applied_index
    }
}
