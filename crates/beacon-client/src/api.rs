//! Client-visible broker API and error taxonomy.
//!
//! The wire protocol is out of scope; brokers expose these operations
//! behind the `BrokerConnection` trait and clients reach them through a
//! `BrokerConnector` that knows how to dial an address. Tests wire the
//! traits straight to an in-process broker.

use async_trait::async_trait;
use beacon_registry::{AgentId, ServiceId, ServiceInfo, ServiceSpec};
use thiserror::Error;

/// Typed failures surfaced by broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// This broker is not the leader; retry against the hinted address.
    #[error("Not leader (hint: {hint:?})")]
    NotLeader { hint: Option<String> },

    /// The broker's proposal channel is full; fail fast, try again later.
    #[error("Broker overloaded")]
    Overloaded,

    /// The operation timed out with unknown outcome; it may have
    /// committed. Registrations are upserts and the rest idempotent, so
    /// retrying is always safe.
    #[error("Timed out, outcome unknown")]
    Timeout,

    /// No quorum: the cluster cannot commit right now.
    #[error("Consensus unavailable")]
    ConsensusUnavailable,

    /// Malformed request, rejected before reaching the log.
    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    /// The agent is mid-shutdown-cascade; transient.
    #[error("Shutdown cascade in progress")]
    CascadeInProgress,

    /// Transport-level failure (connect refused, connection dropped).
    #[error("Broker unavailable: {reason}")]
    Unavailable { reason: String },
}

impl ApiError {
    /// Transient failures worth retrying (possibly on another broker).
    ///
    /// `NotLeader` is handled separately: it is not a failure of the
    /// cluster, just of broker choice, and carries its own redirect.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Overloaded
            | ApiError::Timeout
            | ApiError::ConsensusUnavailable
            | ApiError::CascadeInProgress
            | ApiError::Unavailable { .. } => true,
            ApiError::NotLeader { .. } | ApiError::InvalidCommand { .. } => false,
        }
    }
}

/// Acknowledgment of a committed registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAck {
    /// Log index the registration committed at; durable on a majority.
    pub committed_index: u64,
}

/// One established connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Register an agent and its initial service set.
    ///
    /// Acked post-commit: a returned index is durable.
    async fn register(
        &self,
        agent_id: AgentId,
        address: String,
        services: Vec<ServiceSpec>,
    ) -> Result<RegisterAck, ApiError>;

    /// Keep-alive ping for a registered agent.
    async fn heartbeat(&self, agent_id: AgentId) -> Result<(), ApiError>;

    /// Orderly agent shutdown; cascades deregistration of owned services.
    async fn shutdown_notice(&self, agent_id: AgentId) -> Result<(), ApiError>;

    /// Look up services by name (trailing `*` for prefix match) and
    /// subscribe to shutdown pushes for the returned instances.
    async fn discover(&self, name: &str) -> Result<Vec<ServiceInfo>, ApiError>;

    /// Healthy replacements for a shutting-down instance.
    async fn get_alternatives(&self, service_id: ServiceId) -> Result<Vec<ServiceInfo>, ApiError>;
}

/// Dials broker addresses into connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Box<dyn BrokerConnection>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ApiError::Overloaded.is_retryable());
        assert!(ApiError::Timeout.is_retryable());
        assert!(ApiError::ConsensusUnavailable.is_retryable());
        assert!(ApiError::CascadeInProgress.is_retryable());
        assert!(ApiError::Unavailable {
            reason: "refused".to_string()
        }
        .is_retryable());

        assert!(!ApiError::NotLeader { hint: None }.is_retryable());
        assert!(!ApiError::InvalidCommand {
            reason: "empty id".to_string()
        }
        .is_retryable());
    }
}
