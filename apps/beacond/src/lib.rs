//! beacond broker library.
//!
//! Exposes the broker components for integration tests and embedding.

pub mod agent_session;
pub mod broker;
pub mod client_session;
pub mod config;
pub mod connections;
pub mod health;
pub mod local;
pub mod metrics;
