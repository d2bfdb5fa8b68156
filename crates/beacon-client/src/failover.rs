//! Client-side multi-broker failover.
//!
//! `FailoverClient` holds an ordered list of broker addresses and drives
//! an explicit connection state machine (`Idle / Connecting / Connected /
//! BackingOff`). On a connect failure or mid-session error it retries the
//! current broker up to the policy's `max_retries` with backoff, then
//! rotates to the next address; with `continuous_retry` it wraps past the
//! end of the list instead of giving up. An explicit stop signal cancels
//! any in-flight backoff.
//!
//! Per-connection broker state never replicates, so landing on a new
//! broker means discovery subscriptions are gone: callers must redo
//! `discover`. The connection generation counter exists so they can tell.

use crate::api::{ApiError, BrokerConnection, BrokerConnector, RegisterAck};
use crate::retry::RetryPolicy;
use beacon_registry::{AgentId, ServiceId, ServiceInfo, ServiceSpec};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Failover client configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Ordered broker addresses; connection attempts start at the first.
    pub brokers: Vec<String>,

    /// Per-broker retry budget and backoff shape.
    pub retry: RetryPolicy,

    /// Wrap around the broker list forever instead of giving up after
    /// one full pass.
    pub continuous_retry: bool,
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    BackingOff,
}

/// Cancels a running client from another task.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    /// Signal the client to stop; in-flight backoffs are interrupted.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Multi-broker failover client.
pub struct FailoverClient<C: BrokerConnector> {
    connector: C,
    config: FailoverConfig,

    current: usize,
    conn: Option<Arc<dyn BrokerConnection>>,
    state: ConnectionState,

    /// Bumped on every newly established connection; a change means any
    /// previous discovery subscriptions are gone.
    generation: u64,

    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl<C: BrokerConnector> FailoverClient<C> {
    pub fn new(connector: C, config: FailoverConfig) -> Result<Self, ApiError> {
        if config.brokers.is_empty() {
            return Err(ApiError::InvalidCommand {
                reason: "broker address list must not be empty".to_string(),
            });
        }
        Ok(Self {
            connector,
            config,
            current: 0,
            conn: None,
            state: ConnectionState::Idle,
            generation: 0,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address of the broker currently targeted.
    pub fn current_broker(&self) -> &str {
        &self.config.brokers[self.current]
    }

    /// Connection generation; changes whenever a new connection is
    /// established (same broker or not), i.e. whenever subscriptions
    /// must be re-established via `discover`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Handle for stopping this client from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: self.stopped.clone(),
            notify: self.stop_notify.clone(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stopped_err() -> ApiError {
        ApiError::Unavailable {
            reason: "client stopped".to_string(),
        }
    }

    fn rotate(&mut self) {
        self.conn = None;
        self.current = (self.current + 1) % self.config.brokers.len();
        tracing::debug!(broker = %self.current_broker(), "Rotated to next broker");
    }

    /// Jump straight to a hinted leader if it is in our list, otherwise
    /// just rotate.
    fn redirect(&mut self, hint: Option<&str>) {
        self.conn = None;
        if let Some(hint) = hint {
            if let Some(pos) = self.config.brokers.iter().position(|b| b == hint) {
                self.current = pos;
                tracing::debug!(broker = %hint, "Following leader hint");
                return;
            }
        }
        self.rotate();
    }

    /// Sleep for the jittered backoff, interruptible by stop.
    async fn backoff_sleep(&mut self, attempt: usize) -> Result<(), ApiError> {
        self.state = ConnectionState::BackingOff;
        let delay = self.config.retry.jittered_backoff(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.stop_notify.notified() => Err(Self::stopped_err()),
        }
    }

    /// Drive the state machine until connected (or budget exhausted).
    async fn ensure_connected(&mut self) -> Result<(), ApiError> {
        if self.conn.is_some() {
            self.state = ConnectionState::Connected;
            return Ok(());
        }

        let broker_count = self.config.brokers.len();
        let mut attempt = 0usize;
        let mut brokers_exhausted = 0usize;

        loop {
            if self.is_stopped() {
                self.state = ConnectionState::Idle;
                return Err(Self::stopped_err());
            }

            self.state = ConnectionState::Connecting;
            let addr = self.config.brokers[self.current].clone();

            match self.connector.connect(&addr).await {
                Ok(conn) => {
                    self.conn = Some(Arc::from(conn));
                    self.state = ConnectionState::Connected;
                    self.generation += 1;
                    tracing::info!(broker = %addr, generation = self.generation, "Connected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(broker = %addr, error = %e, attempt, "Connect failed");

                    if attempt >= self.config.retry.max_retries {
                        brokers_exhausted += 1;
                        if brokers_exhausted >= broker_count && !self.config.continuous_retry {
                            self.state = ConnectionState::Idle;
                            return Err(e);
                        }
                        attempt = 0;
                        self.rotate();
                        self.backoff_sleep(0).await?;
                    } else {
                        self.backoff_sleep(attempt).await?;
                        attempt += 1;
                    }
                }
            }
        }
    }

    /// Run one operation with retry-vs-rotate-vs-surface handling.
    async fn call<T, F, Fut>(&mut self, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut(Arc<dyn BrokerConnection>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let broker_count = self.config.brokers.len();
        let budget = if self.config.continuous_retry {
            usize::MAX
        } else {
            (self.config.retry.max_retries + 1) * broker_count
        };

        let mut spent = 0usize;
        let mut attempt_on_current = 0usize;

        loop {
            if self.is_stopped() {
                return Err(Self::stopped_err());
            }

            self.ensure_connected().await?;
            let conn = self.conn.clone().ok_or_else(|| ApiError::Unavailable {
                reason: "connection lost".to_string(),
            })?;

            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    spent = spent.saturating_add(1);
                    if spent >= budget {
                        tracing::warn!(error = %e, "Retry budget exhausted, surfacing failure");
                        return Err(e);
                    }

                    match e {
                        ApiError::NotLeader { ref hint } => {
                            // A hint is fresh information: follow it
                            // immediately. Without one (mid-election),
                            // back off briefly before trying elsewhere.
                            let hint = hint.clone();
                            if hint.is_none() {
                                self.backoff_sleep(0).await?;
                            }
                            self.redirect(hint.as_deref());
                            attempt_on_current = 0;
                        }
                        ref e if e.is_retryable() => {
                            if matches!(e, ApiError::Unavailable { .. }) {
                                // Transport is gone; force a reconnect.
                                self.conn = None;
                            }
                            if attempt_on_current >= self.config.retry.max_retries {
                                self.rotate();
                                attempt_on_current = 0;
                                self.backoff_sleep(0).await?;
                            } else {
                                self.backoff_sleep(attempt_on_current).await?;
                                attempt_on_current += 1;
                            }
                        }
                        e => return Err(e),
                    }
                }
            }
        }
    }

    /// Register an agent with its initial service set.
    pub async fn register(
        &mut self,
        agent_id: AgentId,
        address: String,
        services: Vec<ServiceSpec>,
    ) -> Result<RegisterAck, ApiError> {
        self.call(move |conn| {
            let agent_id = agent_id.clone();
            let address = address.clone();
            let services = services.clone();
            async move { conn.register(agent_id, address, services).await }
        })
        .await
    }

    pub async fn heartbeat(&mut self, agent_id: AgentId) -> Result<(), ApiError> {
        self.call(move |conn| {
            let agent_id = agent_id.clone();
            async move { conn.heartbeat(agent_id).await }
        })
        .await
    }

    pub async fn shutdown_notice(&mut self, agent_id: AgentId) -> Result<(), ApiError> {
        self.call(move |conn| {
            let agent_id = agent_id.clone();
            async move { conn.shutdown_notice(agent_id).await }
        })
        .await
    }

    /// Discover services by name.
    ///
    /// After any reconnect (see [`generation`](Self::generation)) this
    /// must be called again to re-establish push subscriptions; nothing
    /// cluster-replicated is lost, only the local subscription.
    pub async fn discover(&mut self, name: &str) -> Result<Vec<ServiceInfo>, ApiError> {
        let name = name.to_string();
        self.call(move |conn| {
            let name = name.clone();
            async move { conn.discover(&name).await }
        })
        .await
    }

    pub async fn get_alternatives(
        &mut self,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceInfo>, ApiError> {
        self.call(move |conn| {
            let service_id = service_id.clone();
            async move { conn.get_alternatives(service_id).await }
        })
        .await
    }
}
