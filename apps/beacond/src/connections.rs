//! Per-broker client connection table.
//!
//! Strictly local state: nothing in here is replicated, snapshotted, or
//! coordinated across brokers; that is the design boundary, not an
//! oversight. A client that moves brokers re-establishes its entries
//! from scratch via `discover`.

use beacon_client::ApiError;
use beacon_registry::ServiceId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Local connection identifier; unique within one broker process only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Push messages delivered to connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A subscribed service is shutting down; call `get_alternatives`
    /// before tearing the old connection down.
    Shutdown { service_id: ServiceId },
}

/// Handle to a client's transport session for pushes.
#[derive(Clone)]
pub struct ClientPush {
    tx: mpsc::Sender<Notification>,
}

impl ClientPush {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Best-effort push; a full or closed session just drops the message.
    pub fn push(&self, notification: Notification) -> bool {
        self.tx.try_send(notification).is_ok()
    }
}

/// One connected client.
#[derive(Clone)]
pub struct ClientInfo {
    pub connection_id: ConnectionId,

    /// Subscribed service id → discovery name. The name is kept so
    /// `get_alternatives` still works after the instance has been
    /// cascaded out of the registry.
    pub subscriptions: BTreeMap<ServiceId, String>,

    push: ClientPush,
}

/// The per-broker table of connected clients.
///
/// One lock scoped to this table; safe under concurrent session tasks.
pub struct LocalConnectionManager {
    max_clients: usize,
    next_id: AtomicU64,
    table: RwLock<HashMap<ConnectionId, ClientInfo>>,
}

impl LocalConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            next_id: AtomicU64::new(1),
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new client connection.
    pub fn add_client(&self, push: ClientPush) -> Result<ConnectionId, ApiError> {
        let mut table = self.table.write();
        if table.len() >= self.max_clients {
            return Err(ApiError::Overloaded);
        }

        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        table.insert(
            connection_id,
            ClientInfo {
                connection_id,
                subscriptions: BTreeMap::new(),
                push,
            },
        );
        tracing::debug!(conn = %connection_id, clients = table.len(), "Client connected");
        Ok(connection_id)
    }

    /// Drop a client connection; idempotent.
    pub fn remove_client(&self, connection_id: ConnectionId) -> bool {
        let removed = self.table.write().remove(&connection_id).is_some();
        if removed {
            tracing::debug!(conn = %connection_id, "Client disconnected");
        }
        removed
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.table.read().contains_key(&connection_id)
    }

    /// Snapshot of one client's entry.
    pub fn lookup(&self, connection_id: ConnectionId) -> Option<ClientInfo> {
        self.table.read().get(&connection_id).cloned()
    }

    /// Record a subscription (discover result) for a client.
    pub fn subscribe(&self, connection_id: ConnectionId, service_id: ServiceId, name: String) {
        if let Some(client) = self.table.write().get_mut(&connection_id) {
            client.subscriptions.insert(service_id, name);
        }
    }

    /// The discovery name a client is subscribed to a service under.
    pub fn subscription_name(
        &self,
        connection_id: ConnectionId,
        service_id: &ServiceId,
    ) -> Option<String> {
        self.table
            .read()
            .get(&connection_id)
            .and_then(|c| c.subscriptions.get(service_id).cloned())
    }

    /// Number of local clients subscribed to a service.
    pub fn subscriber_count(&self, service_id: &ServiceId) -> usize {
        self.table
            .read()
            .values()
            .filter(|c| c.subscriptions.contains_key(service_id))
            .count()
    }

    pub fn client_count(&self) -> usize {
        self.table.read().len()
    }

    /// Push `notification` to every client matching `predicate`.
    ///
    /// Returns how many clients were notified.
    pub fn broadcast<F>(&self, predicate: F, notification: Notification) -> usize
    where
        F: Fn(&ClientInfo) -> bool,
    {
        let table = self.table.read();
        let mut notified = 0;
        for client in table.values() {
            if predicate(client) && client.push.push(notification.clone()) {
                notified += 1;
            }
        }
        notified
    }

    /// Notify every client subscribed to `service_id` of its shutdown.
    pub fn broadcast_shutdown(&self, service_id: &ServiceId) -> usize {
        let notified = self.broadcast(
            |client| client.subscriptions.contains_key(service_id),
            Notification::Shutdown {
                service_id: service_id.clone(),
            },
        );
        if notified > 0 {
            tracing::debug!(service = %service_id, notified, "Pushed shutdown notifications");
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(manager: &LocalConnectionManager) -> (ConnectionId, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(8);
        let id = manager.add_client(ClientPush::new(tx)).unwrap();
        (id, rx)
    }

    #[test]
    fn add_lookup_remove() {
        let manager = LocalConnectionManager::new(16);
        let (id, _rx) = client(&manager);

        assert!(manager.contains(id));
        assert_eq!(manager.client_count(), 1);

        manager.subscribe(id, ServiceId::new("svc-1"), "search".to_string());
        let info = manager.lookup(id).unwrap();
        assert_eq!(info.connection_id, id);
        assert_eq!(info.subscriptions.len(), 1);

        assert!(manager.remove_client(id));
        assert!(!manager.contains(id));
        assert!(manager.lookup(id).is_none());
        assert!(!manager.remove_client(id));
    }

    #[test]
    fn enforces_client_limit() {
        let manager = LocalConnectionManager::new(2);
        let (_a, _rx_a) = client(&manager);
        let (_b, _rx_b) = client(&manager);

        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            manager.add_client(ClientPush::new(tx)),
            Err(ApiError::Overloaded)
        ));
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let manager = LocalConnectionManager::new(16);
        let (a, mut rx_a) = client(&manager);
        let (b, mut rx_b) = client(&manager);
        let (_c, mut rx_c) = client(&manager);

        let svc = ServiceId::new("svc-1");
        manager.subscribe(a, svc.clone(), "search".to_string());
        manager.subscribe(b, svc.clone(), "search".to_string());

        let notified = manager.broadcast_shutdown(&svc);
        assert_eq!(notified, 2);

        assert_eq!(
            rx_a.try_recv().unwrap(),
            Notification::Shutdown {
                service_id: svc.clone()
            }
        );
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn subscription_name_survives_broadcast() {
        let manager = LocalConnectionManager::new(16);
        let (a, _rx) = client(&manager);

        let svc = ServiceId::new("svc-1");
        manager.subscribe(a, svc.clone(), "search".to_string());
        manager.broadcast_shutdown(&svc);

        // get_alternatives relies on this after the cascade removed the
        // service from the registry.
        assert_eq!(
            manager.subscription_name(a, &svc),
            Some("search".to_string())
        );
    }

    #[test]
    fn subscriber_counts_track_subscriptions() {
        let manager = LocalConnectionManager::new(16);
        let (a, _rx_a) = client(&manager);
        let (b, _rx_b) = client(&manager);

        let svc = ServiceId::new("svc-1");
        manager.subscribe(a, svc.clone(), "search".to_string());
        manager.subscribe(b, svc.clone(), "search".to_string());
        assert_eq!(manager.subscriber_count(&svc), 2);

        manager.remove_client(a);
        assert_eq!(manager.subscriber_count(&svc), 1);
    }

    #[test]
    fn full_push_channel_does_not_block_broadcast() {
        let manager = LocalConnectionManager::new(16);
        let (tx, _rx) = mpsc::channel(1);
        let id = manager.add_client(ClientPush::new(tx)).unwrap();

        let svc = ServiceId::new("svc-1");
        manager.subscribe(id, svc.clone(), "search".to_string());

        // First fills the channel, second is dropped, neither blocks.
        assert_eq!(manager.broadcast_shutdown(&svc), 1);
        assert_eq!(manager.broadcast_shutdown(&svc), 0);
    }
}
