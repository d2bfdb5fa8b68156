//! Per-connection client protocol state machine.
//!
//! `Connected → Discovering → Subscribed → Closed`.
//!
//! `discover` serves the registry read path and implicitly subscribes the
//! connection to every returned instance; shutdown cascades then reach
//! this client as `Notification::Shutdown` pushes, at which point it
//! calls `get_alternatives` before tearing the old connection down.

use crate::broker::BrokerCore;
use crate::connections::{ClientPush, ConnectionId, Notification};
use beacon_client::ApiError;
use beacon_registry::{ServiceId, ServiceInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    Connected,
    Discovering,
    Subscribed,
    Closed,
}

/// One connected client's session.
pub struct ClientSession {
    core: Arc<BrokerCore>,
    connection_id: ConnectionId,
    state: Mutex<ClientSessionState>,
}

impl ClientSession {
    /// Open a session, registering the connection locally.
    ///
    /// Returns the session and the receiver its push notifications
    /// arrive on (the transport layer forwards these to the client).
    pub fn open(
        core: Arc<BrokerCore>,
    ) -> Result<(Self, mpsc::Receiver<Notification>), ApiError> {
        let (tx, rx) = mpsc::channel(32);
        let connection_id = core.open_client(ClientPush::new(tx))?;

        Ok((
            Self {
                core,
                connection_id,
                state: Mutex::new(ClientSessionState::Connected),
            },
            rx,
        ))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> ClientSessionState {
        *self.state.lock()
    }

    /// Discover services by name and subscribe to the results.
    pub fn discover(&self, name: &str) -> Result<Vec<ServiceInfo>, ApiError> {
        {
            let mut state = self.state.lock();
            if *state == ClientSessionState::Closed {
                return Err(ApiError::InvalidCommand {
                    reason: "session closed".to_string(),
                });
            }
            *state = ClientSessionState::Discovering;
        }

        let result = self.core.discover(self.connection_id, name);

        let mut state = self.state.lock();
        if *state == ClientSessionState::Discovering {
            *state = if result.is_ok() {
                ClientSessionState::Subscribed
            } else {
                ClientSessionState::Connected
            };
        }
        result
    }

    /// Healthy replacements for a shutting-down instance.
    pub fn get_alternatives(&self, service_id: &ServiceId) -> Result<Vec<ServiceInfo>, ApiError> {
        if *self.state.lock() == ClientSessionState::Closed {
            return Err(ApiError::InvalidCommand {
                reason: "session closed".to_string(),
            });
        }
        self.core.get_alternatives(self.connection_id, service_id)
    }

    /// Close the session and drop its local connection state.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state != ClientSessionState::Closed {
            *state = ClientSessionState::Closed;
            self.core.close_client(self.connection_id);
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
