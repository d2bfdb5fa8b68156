//! Per-connection agent protocol state machine.
//!
//! `Connecting → Registered → Heartbeating → Draining → Closed`.
//!
//! Registration acks only after commit, so a successful ack means the
//! agent's services are durable. A monitor task watches the heartbeat
//! cadence; once the configured number of beats is missed, the session
//! proposes the shutdown cascade itself and closes.

use crate::broker::BrokerCore;
use beacon_client::{ApiError, RegisterAck};
use beacon_registry::{AgentId, ServiceSpec};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSessionState {
    Connecting,
    Registered,
    Heartbeating,
    Draining,
    Closed,
}

/// Heartbeat reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong;

struct Inner {
    state: AgentSessionState,
    agent_id: Option<AgentId>,
    last_ping: Instant,
}

/// One connected agent's session.
pub struct AgentSession {
    core: Arc<BrokerCore>,
    inner: Arc<Mutex<Inner>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    pub fn new(core: Arc<BrokerCore>) -> Self {
        Self {
            core,
            inner: Arc::new(Mutex::new(Inner {
                state: AgentSessionState::Connecting,
                agent_id: None,
                last_ping: Instant::now(),
            })),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AgentSessionState {
        self.inner.lock().state
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.inner.lock().agent_id.clone()
    }

    /// Register the agent with its initial service set.
    ///
    /// Transitions to `Registered` only after the commands committed;
    /// then immediately to `Heartbeating` with the monitor armed.
    pub async fn register(
        &self,
        agent_id: AgentId,
        address: String,
        services: Vec<ServiceSpec>,
    ) -> Result<RegisterAck, ApiError> {
        {
            let inner = self.inner.lock();
            if inner.state != AgentSessionState::Connecting {
                return Err(ApiError::InvalidCommand {
                    reason: format!("register not valid in state {:?}", inner.state),
                });
            }
        }

        let ack = self
            .core
            .register_agent(agent_id.clone(), address, services)
            .await?;

        {
            let mut inner = self.inner.lock();
            inner.state = AgentSessionState::Registered;
            inner.agent_id = Some(agent_id.clone());
            inner.last_ping = Instant::now();
            inner.state = AgentSessionState::Heartbeating;
        }

        self.spawn_monitor(agent_id.clone());
        tracing::info!(
            agent = %agent_id,
            committed_index = ack.committed_index,
            "Agent registered"
        );
        Ok(ack)
    }

    /// Ping/Pong. The Pong is immediate; the replicated heartbeat-index
    /// refresh is submitted asynchronously.
    pub fn heartbeat(&self) -> Result<Pong, ApiError> {
        let agent_id = {
            let mut inner = self.inner.lock();
            if inner.state != AgentSessionState::Heartbeating {
                return Err(ApiError::InvalidCommand {
                    reason: format!("heartbeat not valid in state {:?}", inner.state),
                });
            }
            inner.last_ping = Instant::now();
            inner.agent_id.clone()
        };

        if let Some(agent_id) = agent_id {
            self.core.heartbeat(&agent_id)?;
        }
        Ok(Pong)
    }

    /// Agent-initiated orderly shutdown.
    ///
    /// Drains for the configured grace window, then proposes the cascade;
    /// the replicated apply event pushes `NotifyShutdown` to subscribed
    /// clients on every broker.
    pub async fn shutdown_notice(&self) -> Result<(), ApiError> {
        let agent_id = {
            let mut inner = self.inner.lock();
            match inner.state {
                AgentSessionState::Heartbeating | AgentSessionState::Registered => {}
                AgentSessionState::Closed => return Ok(()),
                state => {
                    return Err(ApiError::InvalidCommand {
                        reason: format!("shutdown notice not valid in state {state:?}"),
                    })
                }
            }
            inner.state = AgentSessionState::Draining;
            inner.agent_id.clone()
        };

        let Some(agent_id) = agent_id else {
            self.close();
            return Ok(());
        };

        let grace = self.core.config().shutdown_grace();
        if !grace.is_zero() {
            self.core.drain_agent(&agent_id).await?;
            tokio::time::sleep(grace).await;
        }

        let result = self.core.shutdown_agent(&agent_id).await;
        self.close();

        match result {
            Ok(_) => {
                tracing::info!(agent = %agent_id, "Agent shut down cleanly");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Tear the session down without touching replicated state.
    pub fn close(&self) {
        self.inner.lock().state = AgentSessionState::Closed;
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }

    fn spawn_monitor(&self, agent_id: AgentId) {
        let core = self.core.clone();
        let inner = self.inner.clone();
        let interval = self.core.config().agent_heartbeat_interval();
        let threshold = self.core.config().agents.missed_heartbeat_threshold;
        let deadline = interval * threshold;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let (state, elapsed) = {
                    let inner = inner.lock();
                    (inner.state, inner.last_ping.elapsed())
                };

                match state {
                    AgentSessionState::Heartbeating if elapsed > deadline => {
                        tracing::warn!(
                            agent = %agent_id,
                            missed_for = ?elapsed,
                            "Agent missed heartbeats, cascading shutdown"
                        );
                        if let Err(e) = core.shutdown_agent(&agent_id).await {
                            tracing::error!(
                                agent = %agent_id,
                                error = %e,
                                "Heartbeat-timeout cascade failed"
                            );
                        }
                        inner.lock().state = AgentSessionState::Closed;
                        break;
                    }
                    AgentSessionState::Heartbeating => {}
                    // Session moved on (draining/closed); monitor is done.
                    _ => break,
                }
            }
        });

        *self.monitor.lock() = Some(handle);
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }
}
