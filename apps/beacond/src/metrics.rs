//! Broker metrics: Prometheus export plus the typed administrative
//! `ClusterMetrics` snapshot.

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Administrative cluster/broker metrics snapshot.
///
/// Consensus-wide fields (leader, indexes) describe the replicated
/// cluster; `local_*` fields are strictly this broker's own.
#[derive(Debug, Clone)]
pub struct ClusterMetrics {
    pub leader_id: Option<String>,
    pub leader_uptime: Option<Duration>,
    pub commit_index: u64,
    pub applied_index: u64,

    /// Member liveness as observed from this broker.
    pub node_status: BTreeMap<String, String>,

    pub registered_services: usize,
    pub connected_agents: usize,

    /// Clients connected to this broker only.
    pub local_connected_clients: usize,

    /// Mean recent request latency on this broker.
    pub local_request_latency: Duration,
}

const LATENCY_WINDOW: usize = 256;

/// Prometheus-backed broker metrics.
pub struct BrokerMetrics {
    registry: Mutex<Registry>,

    proposals_total: Counter,
    proposal_failures_total: Counter,
    notifications_total: Counter,
    connected_clients: Gauge,
    request_latency_seconds: Histogram,

    /// Recent latencies for the ClusterMetrics mean.
    window: Mutex<VecDeque<Duration>>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // prometheus-client appends the `_total` suffix to counters.
        let proposals_total = Counter::default();
        registry.register(
            "beacond_proposals",
            "Commands proposed through the consensus funnel",
            proposals_total.clone(),
        );

        let proposal_failures_total = Counter::default();
        registry.register(
            "beacond_proposal_failures",
            "Proposals that failed (rejected, timed out, overloaded)",
            proposal_failures_total.clone(),
        );

        let notifications_total = Counter::default();
        registry.register(
            "beacond_notifications",
            "Shutdown notifications pushed to local clients",
            notifications_total.clone(),
        );

        let connected_clients = Gauge::default();
        registry.register(
            "beacond_connected_clients",
            "Currently connected local clients",
            connected_clients.clone(),
        );

        let request_latency_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "beacond_request_latency_seconds",
            "Latency of locally served requests",
            request_latency_seconds.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            proposals_total,
            proposal_failures_total,
            notifications_total,
            connected_clients,
            request_latency_seconds,
            window: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn record_proposal(&self, ok: bool) {
        self.proposals_total.inc();
        if !ok {
            self.proposal_failures_total.inc();
        }
    }

    pub fn record_notifications(&self, count: usize) {
        self.notifications_total.inc_by(count as u64);
    }

    pub fn set_connected_clients(&self, count: usize) {
        self.connected_clients.set(count as i64);
    }

    pub fn record_request(&self, elapsed: Duration) {
        self.request_latency_seconds.observe(elapsed.as_secs_f64());

        let mut window = self.window.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed);
    }

    /// Mean of the recent-latency window.
    pub fn mean_request_latency(&self) -> Duration {
        let window = self.window.lock();
        if window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = window.iter().sum();
        total / window.len() as u32
    }

    /// Prometheus text-format export.
    pub fn export(&self) -> String {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &registry) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        buffer
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_registered_metrics() {
        let metrics = BrokerMetrics::new();
        metrics.record_proposal(true);
        metrics.record_proposal(false);
        metrics.set_connected_clients(3);

        let text = metrics.export();
        assert!(text.contains("beacond_proposals_total 2"));
        assert!(text.contains("beacond_proposal_failures_total 1"));
        assert!(text.contains("beacond_connected_clients 3"));
    }

    #[test]
    fn latency_window_mean() {
        let metrics = BrokerMetrics::new();
        assert_eq!(metrics.mean_request_latency(), Duration::ZERO);

        metrics.record_request(Duration::from_millis(10));
        metrics.record_request(Duration::from_millis(30));
        assert_eq!(metrics.mean_request_latency(), Duration::from_millis(20));
    }

    #[test]
    fn latency_window_is_bounded() {
        let metrics = BrokerMetrics::new();
        for _ in 0..(LATENCY_WINDOW * 2) {
            metrics.record_request(Duration::from_millis(1));
        }
        assert_eq!(metrics.mean_request_latency(), Duration::from_millis(1));
        assert_eq!(metrics.window.lock().len(), LATENCY_WINDOW);
    }
}
