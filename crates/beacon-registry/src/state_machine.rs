//! The replicated registry state machine.
//!
//! Driven strictly sequentially by the consensus apply loop, the single
//! writer of `ClusterState`. Reads go through shared read-locked views
//! handed out by [`state_handle`](RegistryStateMachine::state_handle);
//! no reader ever holds a mutable reference.
//!
//! Every apply publishes an [`ApplyEvent`] so the broker can translate
//! replicated changes (in particular shutdown cascades) into push
//! notifications for its locally connected clients. The event stream is
//! derived from committed commands, so it fires identically on every
//! broker.

use crate::command::Command;
use crate::types::*;
use beacon_raft::{LogIndex, RaftError, StateMachine};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A change that just became visible in the replicated registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    ServiceRegistered {
        service_id: ServiceId,
        name: String,
    },

    ServiceDeregistered {
        service_id: ServiceId,
        name: String,
    },

    /// An agent shut down; every listed service was cascaded away in the
    /// same apply step.
    AgentShutdown {
        agent_id: AgentId,
        removed: Vec<(ServiceId, String)>,
    },
}

/// Deterministic transition function over `ClusterState`.
pub struct RegistryStateMachine {
    state: Arc<RwLock<ClusterState>>,
    events: broadcast::Sender<ApplyEvent>,
}

impl RegistryStateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(ClusterState::new())),
            events,
        }
    }

    /// Shared read handle to the live state, for the store.
    pub fn state_handle(&self) -> Arc<RwLock<ClusterState>> {
        self.state.clone()
    }

    /// Subscribe to apply events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ApplyEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ApplyEvent) {
        // Lagging/absent subscribers are fine; events are advisory for
        // local notification fan-out, never part of replicated state.
        let _ = self.events.send(event);
    }

    /// Apply one committed command at its log index.
    ///
    /// Re-applying at an already-applied index is a no-op (replay after
    /// restart); otherwise `applied_index` moves to exactly `index`.
    fn apply_command(&self, index: u64, command: Command) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            if index <= state.applied_index {
                tracing::debug!(index, applied = state.applied_index, "Skipping replayed entry");
                return;
            }

            match command {
                Command::RegisterService { spec } => {
                    let service = ServiceInfo {
                        service_id: spec.service_id.clone(),
                        name: spec.name.clone(),
                        address: spec.address,
                        metadata: spec.metadata,
                        health: HealthStatus::Healthy,
                        owner_agent_id: spec.owner_agent_id.clone(),
                        registered_at_index: index,
                    };

                    // Re-registration may move the service to a new owner.
                    if let Some(old) = state.services.insert(spec.service_id.clone(), service) {
                        if old.owner_agent_id != spec.owner_agent_id {
                            if let Some(old_owner) = state.agents.get_mut(&old.owner_agent_id) {
                                old_owner.service_ids.remove(&spec.service_id);
                            }
                        }
                    }

                    let owner = state
                        .agents
                        .entry(spec.owner_agent_id.clone())
                        .or_insert_with(|| AgentInfo {
                            agent_id: spec.owner_agent_id.clone(),
                            address: String::new(),
                            status: AgentStatus::Active,
                            last_heartbeat_index: index,
                            service_ids: Default::default(),
                        });
                    owner.service_ids.insert(spec.service_id.clone());

                    events.push(ApplyEvent::ServiceRegistered {
                        service_id: spec.service_id,
                        name: spec.name,
                    });
                }

                Command::DeregisterService { service_id } => {
                    if let Some(removed) = state.services.remove(&service_id) {
                        if let Some(owner) = state.agents.get_mut(&removed.owner_agent_id) {
                            owner.service_ids.remove(&service_id);
                        }
                        events.push(ApplyEvent::ServiceDeregistered {
                            service_id,
                            name: removed.name,
                        });
                    }
                }

                Command::UpdateAgentStatus {
                    agent_id,
                    address,
                    status,
                } => {
                    if status == AgentStatus::Shutdown {
                        // Cascade: drop every owned service, then the
                        // agent itself, in one logical step.
                        let owned: Vec<ServiceId> = state
                            .agents
                            .get(&agent_id)
                            .map(|a| a.service_ids.iter().cloned().collect())
                            .unwrap_or_default();

                        let mut removed = Vec::with_capacity(owned.len());
                        for service_id in owned {
                            if let Some(service) = state.services.remove(&service_id) {
                                removed.push((service_id, service.name));
                            }
                        }
                        state.agents.remove(&agent_id);

                        tracing::info!(
                            agent = %agent_id,
                            services = removed.len(),
                            "Agent shutdown cascade applied"
                        );
                        events.push(ApplyEvent::AgentShutdown { agent_id, removed });
                    } else {
                        let agent =
                            state.agents.entry(agent_id.clone()).or_insert_with(|| AgentInfo {
                                agent_id: agent_id.clone(),
                                address: String::new(),
                                status,
                                last_heartbeat_index: index,
                                service_ids: Default::default(),
                            });
                        if let Some(address) = address {
                            agent.address = address;
                        }
                        agent.status = status;
                        agent.last_heartbeat_index = index;
                    }
                }
            }

            state.applied_index = index;
        }

        for event in events {
            self.emit(event);
        }
    }
}

impl Default for RegistryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for RegistryStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> beacon_raft::Result<()> {
        let command = Command::decode(command).map_err(|e| RaftError::Internal {
            reason: format!("undecodable committed command: {e}"),
        })?;
        self.apply_command(index.as_u64(), command);
        Ok(())
    }

    fn snapshot(&self) -> beacon_raft::Result<Bytes> {
        let state = self.state.read();
        let bytes = state
            .canonical_bytes()
            .map_err(|e| RaftError::Serialization { source: e })?;
        Ok(Bytes::from(bytes))
    }

    fn restore(&mut self, data: &[u8]) -> beacon_raft::Result<()> {
        let restored: ClusterState = bincode::deserialize(data)?;
        tracing::info!(
            applied_index = restored.applied_index,
            services = restored.services.len(),
            agents = restored.agents.len(),
            "Restoring registry from snapshot"
        );
        *self.state.write() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ServiceSpec;
    use std::collections::BTreeMap;

    fn spec(service: &str, name: &str, agent: &str) -> ServiceSpec {
        ServiceSpec {
            service_id: ServiceId::new(service),
            name: name.to_string(),
            address: format!("10.0.0.1:{name}"),
            metadata: BTreeMap::new(),
            owner_agent_id: AgentId::new(agent),
        }
    }

    fn apply(sm: &mut RegistryStateMachine, index: u64, cmd: Command) {
        let encoded = cmd.encode().unwrap();
        sm.apply(LogIndex(index), &encoded).unwrap();
    }

    #[test]
    fn register_creates_service_and_owner() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );

        let state = sm.state_handle();
        let state = state.read();
        assert_eq!(state.applied_index, 1);
        assert_eq!(state.services.len(), 1);

        let agent = state.agents.get(&AgentId::new("agent-1")).unwrap();
        assert!(agent.service_ids.contains(&ServiceId::new("svc-1")));
    }

    #[test]
    fn register_is_upsert_last_index_wins() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );

        let mut updated = spec("svc-1", "search", "agent-1");
        updated.address = "10.0.0.9:1234".to_string();
        apply(&mut sm, 2, Command::RegisterService { spec: updated });

        let state = sm.state_handle();
        let state = state.read();
        let service = state.services.get(&ServiceId::new("svc-1")).unwrap();
        assert_eq!(service.address, "10.0.0.9:1234");
        assert_eq!(service.registered_at_index, 2);
        assert_eq!(state.services.len(), 1);
    }

    #[test]
    fn reregistration_moves_ownership() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );
        apply(
            &mut sm,
            2,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-2"),
            },
        );

        let state = sm.state_handle();
        let state = state.read();
        assert!(!state.agents[&AgentId::new("agent-1")]
            .service_ids
            .contains(&ServiceId::new("svc-1")));
        assert!(state.agents[&AgentId::new("agent-2")]
            .service_ids
            .contains(&ServiceId::new("svc-1")));
    }

    #[test]
    fn deregister_is_idempotent() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );
        apply(
            &mut sm,
            2,
            Command::DeregisterService {
                service_id: ServiceId::new("svc-1"),
            },
        );

        let after_first = {
            let handle = sm.state_handle();
            let state = handle.read();
            state.canonical_bytes().unwrap()
        };

        // Second deregister changes nothing except applied_index.
        apply(
            &mut sm,
            3,
            Command::DeregisterService {
                service_id: ServiceId::new("svc-1"),
            },
        );

        let handle = sm.state_handle();
        let state = handle.read();
        assert!(state.services.is_empty());
        let mut replayed: ClusterState = bincode::deserialize(&after_first).unwrap();
        replayed.applied_index = 3;
        assert_eq!(*state, replayed);
    }

    #[test]
    fn replay_at_same_index_is_noop() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );

        // Replay index 1 with a different command; must be ignored.
        apply(
            &mut sm,
            1,
            Command::DeregisterService {
                service_id: ServiceId::new("svc-1"),
            },
        );

        let state = sm.state_handle();
        let state = state.read();
        assert_eq!(state.services.len(), 1);
        assert_eq!(state.applied_index, 1);
    }

    #[test]
    fn shutdown_cascades_exactly_owned_services() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );
        apply(
            &mut sm,
            2,
            Command::RegisterService {
                spec: spec("svc-2", "search", "agent-1"),
            },
        );
        apply(
            &mut sm,
            3,
            Command::RegisterService {
                spec: spec("svc-3", "billing", "agent-2"),
            },
        );

        let mut events = sm.subscribe_events();
        apply(
            &mut sm,
            4,
            Command::UpdateAgentStatus {
                agent_id: AgentId::new("agent-1"),
                address: None,
                status: AgentStatus::Shutdown,
            },
        );

        let state = sm.state_handle();
        let state = state.read();
        assert_eq!(state.services.len(), 1);
        assert!(state.services.contains_key(&ServiceId::new("svc-3")));
        assert!(!state.agents.contains_key(&AgentId::new("agent-1")));
        assert!(state.agents.contains_key(&AgentId::new("agent-2")));

        match events.try_recv().unwrap() {
            ApplyEvent::AgentShutdown { agent_id, removed } => {
                assert_eq!(agent_id, AgentId::new("agent-1"));
                let mut ids: Vec<_> = removed.iter().map(|(id, _)| id.clone()).collect();
                ids.sort();
                assert_eq!(ids, vec![ServiceId::new("svc-1"), ServiceId::new("svc-2")]);
            }
            other => panic!("expected AgentShutdown, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_refresh_updates_index_and_keeps_address() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::UpdateAgentStatus {
                agent_id: AgentId::new("agent-1"),
                address: Some("10.0.0.1:9000".to_string()),
                status: AgentStatus::Active,
            },
        );
        apply(
            &mut sm,
            2,
            Command::UpdateAgentStatus {
                agent_id: AgentId::new("agent-1"),
                address: None,
                status: AgentStatus::Active,
            },
        );

        let state = sm.state_handle();
        let state = state.read();
        let agent = state.agents.get(&AgentId::new("agent-1")).unwrap();
        assert_eq!(agent.address, "10.0.0.1:9000");
        assert_eq!(agent.last_heartbeat_index, 2);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut sm = RegistryStateMachine::new();
        apply(
            &mut sm,
            1,
            Command::RegisterService {
                spec: spec("svc-1", "search", "agent-1"),
            },
        );
        apply(
            &mut sm,
            2,
            Command::RegisterService {
                spec: spec("svc-2", "billing", "agent-2"),
            },
        );

        let snapshot = sm.snapshot().unwrap();

        let mut restored = RegistryStateMachine::new();
        restored.restore(&snapshot).unwrap();

        let a = sm.state_handle();
        let b = restored.state_handle();
        assert_eq!(*a.read(), *b.read());
        assert_eq!(
            a.read().canonical_bytes().unwrap(),
            b.read().canonical_bytes().unwrap()
        );
    }
}
