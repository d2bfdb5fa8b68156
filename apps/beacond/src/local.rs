//! In-process broker connections.
//!
//! The wire transport lives outside the core; this module provides the
//! in-process equivalent: a `BrokerConnector` that resolves addresses to
//! `BrokerCore` instances in the same process and speaks to them through
//! real sessions. Multi-broker integration tests and embedded setups use
//! it the way the consensus layer uses its in-memory transport.

use crate::agent_session::AgentSession;
use crate::broker::BrokerCore;
use crate::client_session::ClientSession;
use crate::connections::Notification;
use async_trait::async_trait;
use beacon_client::{ApiError, BrokerConnection, BrokerConnector, RegisterAck};
use beacon_registry::{AgentId, ServiceId, ServiceInfo, ServiceSpec};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Address → broker registry for one process.
#[derive(Clone, Default)]
pub struct LocalBrokerDirectory {
    brokers: Arc<RwLock<HashMap<String, Arc<BrokerCore>>>>,
}

impl LocalBrokerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: impl Into<String>, core: Arc<BrokerCore>) {
        self.brokers.write().insert(addr.into(), core);
    }

    /// Remove a broker, making its address unreachable (crash simulation).
    pub fn remove(&self, addr: &str) -> Option<Arc<BrokerCore>> {
        self.brokers.write().remove(addr)
    }

    fn get(&self, addr: &str) -> Option<Arc<BrokerCore>> {
        self.brokers.read().get(addr).cloned()
    }
}

/// Connector over a [`LocalBrokerDirectory`].
#[derive(Clone)]
pub struct LocalConnector {
    directory: LocalBrokerDirectory,
}

impl LocalConnector {
    pub fn new(directory: LocalBrokerDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl BrokerConnector for LocalConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn BrokerConnection>, ApiError> {
        let core = self.directory.get(addr).ok_or_else(|| ApiError::Unavailable {
            reason: format!("broker {addr} unreachable"),
        })?;
        let conn = LocalConnection::open(core)?;
        Ok(Box::new(conn))
    }
}

/// One in-process connection: an agent session and a client session over
/// the same broker, mirroring what a wire connection would multiplex.
pub struct LocalConnection {
    agent: AgentSession,
    client: ClientSession,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
}

impl LocalConnection {
    pub fn open(core: Arc<BrokerCore>) -> Result<Self, ApiError> {
        let agent = AgentSession::new(core.clone());
        let (client, notifications) = ClientSession::open(core)?;
        Ok(Self {
            agent,
            client,
            notifications: Mutex::new(Some(notifications)),
        })
    }

    /// Take the push-notification receiver (once).
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.lock().take()
    }

    pub fn client_session(&self) -> &ClientSession {
        &self.client
    }
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn register(
        &self,
        agent_id: AgentId,
        address: String,
        services: Vec<ServiceSpec>,
    ) -> Result<RegisterAck, ApiError> {
        self.agent.register(agent_id, address, services).await
    }

    async fn heartbeat(&self, _agent_id: AgentId) -> Result<(), ApiError> {
        self.agent.heartbeat().map(|_| ())
    }

    async fn shutdown_notice(&self, _agent_id: AgentId) -> Result<(), ApiError> {
        self.agent.shutdown_notice().await
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceInfo>, ApiError> {
        self.client.discover(name)
    }

    async fn get_alternatives(&self, service_id: ServiceId) -> Result<Vec<ServiceInfo>, ApiError> {
        self.client.get_alternatives(&service_id)
    }
}
