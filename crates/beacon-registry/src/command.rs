//! Replicated commands.
//!
//! The closed set of mutations that may enter the consensus log. Every
//! variant is upsert- or idempotent-shaped so a caller that times out can
//! safely retry: re-registering the same service id overwrites, and
//! deregistering an absent service is a no-op.

use crate::error::{RegistryError, Result};
use crate::types::{AgentId, AgentStatus, ServiceId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A service registration as supplied by an agent, before consensus
/// assigns it a log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_id: ServiceId,
    pub name: String,
    pub address: String,
    pub metadata: BTreeMap<String, String>,
    pub owner_agent_id: AgentId,
}

/// A mutation of the replicated registry.
///
/// Exhaustively matched in the state machine, so adding a variant is a
/// compile-checked change everywhere it matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Upsert a service instance (never fails on duplicate id;
    /// last-applied-index wins).
    RegisterService { spec: ServiceSpec },

    /// Remove a service instance (no-op if absent).
    DeregisterService { service_id: ServiceId },

    /// Upsert an agent's status. `Shutdown` cascades removal of every
    /// service the agent owns, then removes the agent, in one step.
    /// `address: None` keeps the agent's existing address (heartbeat
    /// refresh path).
    UpdateAgentStatus {
        agent_id: AgentId,
        address: Option<String>,
        status: AgentStatus,
    },
}

impl Command {
    /// Encode for the consensus log.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode a committed log payload.
    pub fn decode(data: &[u8]) -> Result<Command> {
        Ok(bincode::deserialize(data)?)
    }

    /// Reject malformed payloads before they reach the log.
    pub fn validate(&self) -> Result<()> {
        fn required(field: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(RegistryError::InvalidCommand {
                    reason: format!("{field} must not be empty"),
                });
            }
            Ok(())
        }

        match self {
            Command::RegisterService { spec } => {
                required("service_id", spec.service_id.as_str())?;
                required("name", &spec.name)?;
                required("address", &spec.address)?;
                required("owner_agent_id", spec.owner_agent_id.as_str())?;
                if spec.name.contains('*') {
                    return Err(RegistryError::InvalidCommand {
                        reason: "service name must not contain '*'".to_string(),
                    });
                }
                Ok(())
            }
            Command::DeregisterService { service_id } => {
                required("service_id", service_id.as_str())
            }
            Command::UpdateAgentStatus {
                agent_id, address, ..
            } => {
                required("agent_id", agent_id.as_str())?;
                if let Some(address) = address {
                    required("address", address)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            service_id: ServiceId::new("svc-1"),
            name: "search".to_string(),
            address: "10.0.0.1:9001".to_string(),
            metadata: BTreeMap::new(),
            owner_agent_id: AgentId::new("agent-1"),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let cmd = Command::RegisterService { spec: spec() };
        let encoded = cmd.encode().unwrap();
        let decoded = Command::decode(&encoded).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(Command::RegisterService { spec: spec() }.validate().is_ok());
        assert!(Command::DeregisterService {
            service_id: ServiceId::new("svc-1")
        }
        .validate()
        .is_ok());
        assert!(Command::UpdateAgentStatus {
            agent_id: AgentId::new("agent-1"),
            address: None,
            status: AgentStatus::Active,
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn validate_rejects_empty_ids() {
        let mut bad = spec();
        bad.service_id = ServiceId::new("");
        assert!(Command::RegisterService { spec: bad }.validate().is_err());

        assert!(Command::UpdateAgentStatus {
            agent_id: AgentId::new("  "),
            address: None,
            status: AgentStatus::Active,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn validate_rejects_wildcard_in_name() {
        let mut bad = spec();
        bad.name = "search*".to_string();
        assert!(Command::RegisterService { spec: bad }.validate().is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Command::decode(b"not a command").is_err());
    }
}
