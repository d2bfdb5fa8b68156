//! beacond: consistent service-discovery broker.

use beacond::broker::BrokerCore;
use beacond::config::BrokerConfig;
use beacon_raft::transport::InMemoryTransport;
use beacon_raft::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "beacond.yaml".to_string());

    // Load configuration (file first, environment fallback).
    let config = if std::path::Path::new(&config_path).exists() {
        tracing::info!("Loading configuration from: {}", config_path);
        BrokerConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        BrokerConfig::load_from_env()?
    };

    tracing::info!("Starting beacond node: {}", config.node_id);
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Data directory: {}", config.data_dir.display());

    // The consensus wire transport is provided by the deployment; this
    // binary wires the in-process transport, which serves a single-node
    // cluster.
    if config.members().len() > 1 {
        tracing::warn!(
            "Multiple cluster members configured but no network transport is wired; \
             peers will be unreachable from this process"
        );
    }
    let transport = Arc::new(InMemoryTransport::new(
        NodeId::new(&config.node_id),
        HashMap::new(),
    ));

    let core = BrokerCore::new(config, transport, None).await?;
    core.start().await?;

    tracing::info!("beacond is ready");

    let mut fatal_rx = core.subscribe_fatal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, shutting down");
        }
        reason = fatal_rx.recv() => {
            if let Ok(reason) = reason {
                tracing::error!(%reason, "Fatal consensus error; restart from snapshot required");
            }
        }
    }

    core.shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}
