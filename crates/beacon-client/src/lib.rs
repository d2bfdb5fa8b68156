//! beacon-client: client-side broker failover.
//!
//! Consumers hold an ordered list of broker addresses; this crate drives
//! connection establishment, retry-with-backoff, rotation between
//! brokers, and leader-hint redirects, surfacing the broker cluster's
//! typed error taxonomy.

pub mod api;
pub mod failover;
pub mod retry;

pub use api::{ApiError, BrokerConnection, BrokerConnector, RegisterAck};
pub use failover::{ConnectionState, FailoverClient, FailoverConfig, StopHandle};
pub use retry::RetryPolicy;
