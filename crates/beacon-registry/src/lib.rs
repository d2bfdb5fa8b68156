//! beacon-registry: the replicated service/agent registry.
//!
//! A deterministic state machine over `ClusterState` driven by the
//! consensus apply path, plus the read-only store views served to
//! sessions. Commands are upsert/idempotent so unknown-outcome retries
//! are always safe.

pub mod command;
pub mod error;
pub mod state_machine;
pub mod store;
pub mod types;

pub use command::{Command, ServiceSpec};
pub use error::{RegistryError, Result};
pub use state_machine::{ApplyEvent, RegistryStateMachine};
pub use store::{ReadPolicy, RegistryStore};
pub use types::*;
