//! Broker composition root.
//!
//! `BrokerCore` wires the consensus module, the replicated registry, the
//! local connection table, and metrics together, and exposes the typed
//! operations the session state machines call.
//!
//! All mutations (explicit RPCs, heartbeat refreshes, cascades) funnel
//! through one bounded proposal channel into consensus, preserving total
//! order; when the channel is full, new writes fail fast with
//! `Overloaded` instead of queueing unboundedly. Replicated changes come
//! back out through the registry's apply-event stream, which this broker
//! turns into push notifications for its own locally connected clients.

use crate::config::BrokerConfig;
use crate::connections::{ClientPush, ConnectionId, LocalConnectionManager};
use crate::metrics::{BrokerMetrics, ClusterMetrics};
use beacon_client::{ApiError, RegisterAck};
use beacon_raft::log::RaftLog;
use beacon_raft::transport::{RaftTransport, RpcReceiver};
use beacon_raft::{NodeId, Raft, RaftError, ReplicatedLog, SnapshotStore, StateMachine};
use beacon_registry::{
    AgentId, AgentStatus, ApplyEvent, Command, RegistryError, RegistryStateMachine, RegistryStore,
    ServiceId, ServiceInfo, ServiceSpec,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};

/// Broker startup errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerInitError {
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// One queued mutation; `respond` is absent for fire-and-forget
/// refreshes (heartbeats).
struct Proposal {
    command: Command,
    respond: Option<oneshot::Sender<Result<u64, ApiError>>>,
}

/// The broker's composition root.
pub struct BrokerCore {
    config: BrokerConfig,
    node_id: NodeId,

    raft: Arc<Raft>,
    store: RegistryStore,
    connections: Arc<LocalConnectionManager>,
    metrics: Arc<BrokerMetrics>,

    /// NodeId → session address, for leader redirect hints.
    member_addrs: HashMap<NodeId, String>,

    proposal_tx: mpsc::Sender<Proposal>,
    proposal_rx: Mutex<Option<mpsc::Receiver<Proposal>>>,
    events_rx: Mutex<Option<broadcast::Receiver<ApplyEvent>>>,

    /// Agents with a shutdown cascade proposed but not yet applied.
    cascading: Mutex<HashSet<AgentId>>,

    shutdown_tx: broadcast::Sender<()>,

    /// Set once `shutdown` runs; every subsequent operation fails fast,
    /// like a dropped connection to a crashed broker would.
    stopped: std::sync::atomic::AtomicBool,
}

impl BrokerCore {
    /// Build a broker from configuration and a consensus transport.
    ///
    /// The transport is injected: production plugs in the wire transport,
    /// tests an in-memory one.
    pub async fn new(
        config: BrokerConfig,
        transport: Arc<dyn RaftTransport>,
        rpc_rx: Option<RpcReceiver>,
    ) -> Result<Arc<Self>, BrokerInitError> {
        config
            .validate()
            .map_err(|e| BrokerInitError::Init(e.to_string()))?;

        std::fs::create_dir_all(config.raft_dir())
            .map_err(|e| BrokerInitError::Init(format!("failed to create raft dir: {e}")))?;

        let (log, recovery) = RaftLog::open(config.raft_dir()).await?;
        tracing::info!(
            entries = recovery.entries_recovered,
            discarded = recovery.bytes_discarded,
            "Opened consensus log"
        );

        let snapshots = SnapshotStore::open(config.snapshot_dir())?;

        let state_machine = RegistryStateMachine::new();
        let store = RegistryStore::new(state_machine.state_handle());
        let events_rx = state_machine.subscribe_events();

        let node_id = NodeId::new(&config.node_id);
        let raft = Arc::new(Raft::new(
            node_id.clone(),
            config.raft_config(),
            log,
            transport,
            config.members(),
            Arc::new(AsyncMutex::new(state_machine)) as Arc<AsyncMutex<dyn StateMachine>>,
            snapshots,
            rpc_rx,
        )?);

        let (proposal_tx, proposal_rx) = mpsc::channel(config.clients.proposal_queue_depth);
        let (shutdown_tx, _) = broadcast::channel(4);

        let connections = Arc::new(LocalConnectionManager::new(config.clients.max_connections));
        let member_addrs = config.member_addrs();

        Ok(Arc::new(Self {
            config,
            node_id,
            raft,
            store,
            connections,
            metrics: Arc::new(BrokerMetrics::new()),
            member_addrs,
            proposal_tx,
            proposal_rx: Mutex::new(Some(proposal_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            cascading: Mutex::new(HashSet::new()),
            shutdown_tx,
            stopped: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    /// Start consensus and the broker's own background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerInitError> {
        self.raft.start().await?;

        let proposal_rx = self
            .proposal_rx
            .lock()
            .take()
            .ok_or_else(|| BrokerInitError::Init("broker already started".to_string()))?;
        tokio::spawn(proposal_pump(
            self.clone(),
            proposal_rx,
            self.shutdown_tx.subscribe(),
        ));

        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| BrokerInitError::Init("broker already started".to_string()))?;
        tokio::spawn(event_fanout(
            self.clone(),
            events_rx,
            self.shutdown_tx.subscribe(),
        ));

        tracing::info!(node = %self.node_id, "Broker started");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.raft.shutdown();
    }

    fn check_alive(&self) -> Result<(), ApiError> {
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ApiError::Unavailable {
                reason: "broker shut down".to_string(),
            });
        }
        Ok(())
    }

    /// Fatal consensus conditions (detected log divergence); the process
    /// should exit when this fires.
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<String> {
        self.raft.subscribe_fatal()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn connections(&self) -> &LocalConnectionManager {
        &self.connections
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.raft.current_term().as_u64()
    }

    fn leader_hint(&self) -> Option<String> {
        self.raft
            .leader()
            .and_then(|id| self.member_addrs.get(&id).cloned())
    }

    fn map_raft_err(&self, e: RaftError) -> ApiError {
        match e {
            RaftError::NotLeader { leader } => ApiError::NotLeader {
                hint: leader.and_then(|id| self.member_addrs.get(&id).cloned()),
            },
            RaftError::CommitTimeout { .. } => ApiError::Timeout,
            RaftError::QuorumUnavailable { .. } => ApiError::ConsensusUnavailable,
            other => ApiError::Unavailable {
                reason: other.to_string(),
            },
        }
    }

    fn invalid(e: RegistryError) -> ApiError {
        match e {
            RegistryError::InvalidCommand { reason } => ApiError::InvalidCommand { reason },
            other => ApiError::InvalidCommand {
                reason: other.to_string(),
            },
        }
    }

    /// Propose a mutation through the bounded funnel and wait for its
    /// post-commit result.
    pub async fn propose(&self, command: Command) -> Result<u64, ApiError> {
        self.check_alive()?;
        command.validate().map_err(Self::invalid)?;

        let (tx, rx) = oneshot::channel();
        self.proposal_tx
            .try_send(Proposal {
                command,
                respond: Some(tx),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ApiError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => ApiError::Unavailable {
                    reason: "proposal funnel closed".to_string(),
                },
            })?;

        rx.await.map_err(|_| ApiError::Unavailable {
            reason: "broker shutting down".to_string(),
        })?
    }

    /// Fire-and-forget submission (heartbeat refresh path). Never blocks
    /// on a slow apply; a full funnel just drops the refresh.
    fn submit_async(&self, command: Command) {
        if let Err(e) = command.validate() {
            tracing::debug!(error = %e, "Dropping invalid async proposal");
            return;
        }
        if self
            .proposal_tx
            .try_send(Proposal {
                command,
                respond: None,
            })
            .is_err()
        {
            tracing::debug!("Proposal funnel full, dropping async refresh");
        }
    }

    /// Register an agent and its initial service set.
    ///
    /// Acked only after every command committed; the returned index is
    /// durable on a majority.
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        address: String,
        services: Vec<ServiceSpec>,
    ) -> Result<RegisterAck, ApiError> {
        if self.cascading.lock().contains(&agent_id) {
            return Err(ApiError::CascadeInProgress);
        }
        for spec in &services {
            if spec.owner_agent_id != agent_id {
                return Err(ApiError::InvalidCommand {
                    reason: format!(
                        "service {} is not owned by registering agent {}",
                        spec.service_id, agent_id
                    ),
                });
            }
        }

        let mut last = self
            .propose(Command::UpdateAgentStatus {
                agent_id: agent_id.clone(),
                address: Some(address),
                status: AgentStatus::Active,
            })
            .await?;

        for spec in services {
            last = self.propose(Command::RegisterService { spec }).await?;
        }

        Ok(RegisterAck {
            committed_index: last,
        })
    }

    /// Record an agent heartbeat.
    ///
    /// The replicated `last_heartbeat_index` refresh rides the async
    /// path so a slow apply never delays the Pong.
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<(), ApiError> {
        self.check_alive()?;
        if self.cascading.lock().contains(agent_id) {
            return Err(ApiError::CascadeInProgress);
        }
        if self.store.get_agent(agent_id).is_none() {
            return Err(ApiError::InvalidCommand {
                reason: format!("agent {agent_id} is not registered"),
            });
        }
        self.submit_async(Command::UpdateAgentStatus {
            agent_id: agent_id.clone(),
            address: None,
            status: AgentStatus::Active,
        });
        Ok(())
    }

    /// Mark an agent draining (shutdown grace window).
    pub async fn drain_agent(&self, agent_id: &AgentId) -> Result<u64, ApiError> {
        self.propose(Command::UpdateAgentStatus {
            agent_id: agent_id.clone(),
            address: None,
            status: AgentStatus::Draining,
        })
        .await
    }

    /// Cascade an agent away: every owned service is removed with it in
    /// one replicated step.
    pub async fn shutdown_agent(&self, agent_id: &AgentId) -> Result<u64, ApiError> {
        {
            let mut cascading = self.cascading.lock();
            if !cascading.insert(agent_id.clone()) {
                return Err(ApiError::CascadeInProgress);
            }
        }

        let result = self
            .propose(Command::UpdateAgentStatus {
                agent_id: agent_id.clone(),
                address: None,
                status: AgentStatus::Shutdown,
            })
            .await;

        self.cascading.lock().remove(agent_id);
        result
    }

    /// Deregister a single service.
    pub async fn deregister_service(&self, service_id: ServiceId) -> Result<u64, ApiError> {
        self.propose(Command::DeregisterService { service_id }).await
    }

    fn check_readable(&self) -> Result<(), ApiError> {
        self.check_alive()?;
        let permitted = self.config.read_policy.permits(
            self.raft.is_leader(),
            self.raft.commit_index().as_u64(),
            self.store.applied_index(),
        );
        if permitted {
            Ok(())
        } else {
            Err(ApiError::NotLeader {
                hint: self.leader_hint(),
            })
        }
    }

    /// Serve a discovery query and subscribe the connection to every
    /// returned instance for shutdown pushes.
    pub fn discover(
        &self,
        connection_id: ConnectionId,
        name: &str,
    ) -> Result<Vec<ServiceInfo>, ApiError> {
        let started = Instant::now();
        self.check_readable()?;

        let results = self.store.query(name);
        for service in &results {
            self.connections
                .subscribe(connection_id, service.service_id.clone(), service.name.clone());
        }

        self.metrics.record_request(started.elapsed());
        Ok(results)
    }

    /// Healthy replacements for a (possibly already removed) instance,
    /// least-locally-loaded first, stable by id beyond that.
    pub fn get_alternatives(
        &self,
        connection_id: ConnectionId,
        service_id: &ServiceId,
    ) -> Result<Vec<ServiceInfo>, ApiError> {
        let started = Instant::now();
        self.check_readable()?;

        // The instance is usually gone from the registry by the time the
        // client reacts to NotifyShutdown; its name survives in the local
        // subscription record.
        let name = self
            .connections
            .subscription_name(connection_id, service_id)
            .or_else(|| self.store.get(service_id).map(|s| s.name));

        let Some(name) = name else {
            self.metrics.record_request(started.elapsed());
            return Ok(Vec::new());
        };

        let mut alternatives = self.store.alternatives_by_name(&name, service_id);
        alternatives.sort_by_key(|s| {
            (
                self.connections.subscriber_count(&s.service_id),
                s.service_id.clone(),
            )
        });

        self.metrics.record_request(started.elapsed());
        Ok(alternatives)
    }

    /// Accept a new local client connection.
    pub fn open_client(&self, push: ClientPush) -> Result<ConnectionId, ApiError> {
        self.check_alive()?;
        let id = self.connections.add_client(push)?;
        self.metrics
            .set_connected_clients(self.connections.client_count());
        Ok(id)
    }

    /// Drop a local client connection; idempotent.
    pub fn close_client(&self, connection_id: ConnectionId) {
        self.connections.remove_client(connection_id);
        self.metrics
            .set_connected_clients(self.connections.client_count());
    }

    /// Administrative metrics snapshot.
    pub fn cluster_metrics(&self) -> ClusterMetrics {
        let node_status = self
            .raft
            .peer_status()
            .into_iter()
            .map(|(id, status)| (id.0, status.to_string()))
            .collect();

        ClusterMetrics {
            leader_id: self.raft.leader().map(|l| l.0),
            leader_uptime: self.raft.leader_uptime(),
            commit_index: self.raft.commit_index().as_u64(),
            applied_index: self.raft.applied_index().as_u64(),
            node_status,
            registered_services: self.store.service_count(),
            connected_agents: self.store.agent_count(),
            local_connected_clients: self.connections.client_count(),
            local_request_latency: self.metrics.mean_request_latency(),
        }
    }

    /// Reconfigure snapshotting at runtime; the entry-count trigger keeps
    /// its current value.
    pub fn configure_snapshots(&self, interval: Duration, retention_count: usize, compress: bool) {
        let mut policy = self.raft.snapshot_policy();
        policy.interval = interval;
        policy.retention_count = retention_count;
        policy.compress = compress;
        self.raft.configure_snapshots(policy);
    }
}

/// Forwards queued proposals into consensus, one at a time, preserving
/// submission order.
async fn proposal_pump(
    core: Arc<BrokerCore>,
    mut proposal_rx: mpsc::Receiver<Proposal>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            maybe = proposal_rx.recv() => {
                let Some(proposal) = maybe else { break };

                let result = match proposal.command.encode() {
                    Ok(bytes) => core
                        .raft
                        .propose(bytes)
                        .await
                        .map(|index| index.as_u64())
                        .map_err(|e| core.map_raft_err(e)),
                    Err(e) => Err(BrokerCore::invalid(e)),
                };

                core.metrics.record_proposal(result.is_ok());

                match proposal.respond {
                    Some(respond) => {
                        let _ = respond.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::debug!(error = %e, "Async proposal failed");
                        }
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Proposal pump shutting down");
                break;
            }
        }
    }
}

/// Turns replicated apply events into local push notifications.
///
/// Runs on every broker, so a cascade committed anywhere reaches the
/// subscribers of every broker without cross-broker coordination.
async fn event_fanout(
    core: Arc<BrokerCore>,
    mut events_rx: broadcast::Receiver<ApplyEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(ApplyEvent::AgentShutdown { agent_id, removed }) => {
                        let mut notified = 0;
                        for (service_id, _name) in &removed {
                            notified += core.connections.broadcast_shutdown(service_id);
                        }
                        core.metrics.record_notifications(notified);
                        tracing::info!(
                            agent = %agent_id,
                            services = removed.len(),
                            notified,
                            "Cascade notifications delivered"
                        );
                    }
                    Ok(ApplyEvent::ServiceDeregistered { service_id, .. }) => {
                        let notified = core.connections.broadcast_shutdown(&service_id);
                        core.metrics.record_notifications(notified);
                    }
                    Ok(ApplyEvent::ServiceRegistered { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Apply event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Event fan-out shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use beacon_raft::transport::InMemoryTransport;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn single_node_broker() -> (Arc<BrokerCore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            "node_id: \"b1\"\ndata_dir: \"{}\"\n",
            dir.path().display()
        );
        let config: BrokerConfig = serde_yaml::from_str(&yaml).unwrap();

        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(
            NodeId::new("b1"),
            HashMap::new(),
        ));

        let core = BrokerCore::new(config, transport, None).await.unwrap();
        core.start().await.unwrap();

        // Single-member cluster: wait until it elects itself.
        for _ in 0..100 {
            if core.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(core.is_leader());

        (core, dir)
    }

    fn spec(service: &str, name: &str, agent: &str) -> ServiceSpec {
        ServiceSpec {
            service_id: ServiceId::new(service),
            name: name.to_string(),
            address: format!("10.0.0.1:{service}"),
            metadata: Default::default(),
            owner_agent_id: AgentId::new(agent),
        }
    }

    fn open_test_client(core: &Arc<BrokerCore>) -> ConnectionId {
        let (tx, _rx) = mpsc::channel(8);
        core.open_client(ClientPush::new(tx)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_then_discover() {
        let (core, _dir) = single_node_broker().await;

        let ack = core
            .register_agent(
                AgentId::new("agent-1"),
                "10.0.0.1:9000".to_string(),
                vec![spec("svc-1", "search", "agent-1")],
            )
            .await
            .unwrap();
        assert!(ack.committed_index >= 2);

        let conn = open_test_client(&core);
        let found = core.discover(conn, "search").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service_id, ServiceId::new("svc-1"));

        // Discovery establishes the implicit subscription.
        assert_eq!(
            core.connections().subscription_name(conn, &ServiceId::new("svc-1")),
            Some("search".to_string())
        );

        core.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_foreign_service_ownership() {
        let (core, _dir) = single_node_broker().await;

        let result = core
            .register_agent(
                AgentId::new("agent-1"),
                "10.0.0.1:9000".to_string(),
                vec![spec("svc-1", "search", "agent-2")],
            )
            .await;
        assert!(matches!(result, Err(ApiError::InvalidCommand { .. })));

        core.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_command_rejected_before_log() {
        let (core, _dir) = single_node_broker().await;
        let applied_before = core.store().applied_index();

        let result = core
            .propose(Command::DeregisterService {
                service_id: ServiceId::new(""),
            })
            .await;
        assert!(matches!(result, Err(ApiError::InvalidCommand { .. })));

        // Nothing reached the log.
        assert_eq!(core.store().applied_index(), applied_before);

        core.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn alternatives_rank_by_local_load() {
        let (core, _dir) = single_node_broker().await;

        core.register_agent(
            AgentId::new("agent-1"),
            "10.0.0.1:9000".to_string(),
            vec![
                spec("svc-a", "search", "agent-1"),
                spec("svc-b", "search", "agent-1"),
                spec("svc-c", "search", "agent-1"),
            ],
        )
        .await
        .unwrap();

        // Two clients subscribed to svc-b, one to svc-c, none to svc-a.
        let c1 = open_test_client(&core);
        let c2 = open_test_client(&core);
        core.connections()
            .subscribe(c1, ServiceId::new("svc-b"), "search".to_string());
        core.connections()
            .subscribe(c2, ServiceId::new("svc-b"), "search".to_string());
        core.connections()
            .subscribe(c2, ServiceId::new("svc-c"), "search".to_string());

        let asking = open_test_client(&core);
        core.connections()
            .subscribe(asking, ServiceId::new("svc-b"), "search".to_string());

        let alts = core
            .get_alternatives(asking, &ServiceId::new("svc-b"))
            .unwrap();
        let ids: Vec<_> = alts.iter().map(|s| s.service_id.as_str()).collect();
        assert_eq!(ids, vec!["svc-a", "svc-c"]);

        core.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cluster_metrics_reflect_state() {
        let (core, _dir) = single_node_broker().await;

        core.register_agent(
            AgentId::new("agent-1"),
            "10.0.0.1:9000".to_string(),
            vec![spec("svc-1", "search", "agent-1")],
        )
        .await
        .unwrap();
        let _conn = open_test_client(&core);

        let metrics = core.cluster_metrics();
        assert_eq!(metrics.leader_id, Some("b1".to_string()));
        assert!(metrics.leader_uptime.is_some());
        assert_eq!(metrics.registered_services, 1);
        assert_eq!(metrics.connected_agents, 1);
        assert_eq!(metrics.local_connected_clients, 1);
        assert_eq!(metrics.applied_index, metrics.commit_index);
        assert_eq!(metrics.node_status.get("b1"), Some(&"up".to_string()));

        core.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn configure_snapshots_updates_policy() {
        let (core, _dir) = single_node_broker().await;

        core.configure_snapshots(Duration::from_secs(30), 5, true);
        let policy = core.raft.snapshot_policy();
        assert_eq!(policy.interval, Duration::from_secs(30));
        assert_eq!(policy.retention_count, 5);
        assert!(policy.compress);

        core.shutdown();
    }
}
