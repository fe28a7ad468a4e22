//! lookoutd: network crawler daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use lookout_core::config::LookoutConfig;
use lookout_services::{DnsResolver, JsonFileStore, Repository, RepositoryConfig, Tracker};

use lookoutd::{ChannelSink, Manager, ManagerConfig, MessageSink, PeerConfig, Recorder};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = LookoutConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = LookoutConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LookoutConfig::default()
    });
    let network = config.network.network;
    tracing::info!(%network, port = config.network.listen_port, "lookoutd starting");

    // Address book
    let store = JsonFileStore::new(&config.repository.backup_path);
    tracing::info!(path = %store.path().display(), "address book location");
    let repository = Repository::spawn(
        RepositoryConfig::from_settings(network, &config.repository),
        store,
        DnsResolver::new().with_timeout(Duration::from_secs(config.repository.dns_timeout_secs)),
    );

    // Output path
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let tracker = Arc::new(Tracker::new(config.tracker.shards));
    let (sink, messages) = ChannelSink::channel(1024);
    let recorder = tokio::spawn(Recorder::new(tracker.clone(), messages, shutdown_tx.subscribe()).run());

    // Connection manager
    let peer_config = PeerConfig::from_settings(&config.network, &config.peer);
    tracing::info!(nonce = hex::encode(peer_config.nonce.to_le_bytes()), "local nonce");
    let manager = Manager::new(
        ManagerConfig::from_config(&config),
        peer_config,
        repository.clone(),
        Arc::new(sink) as Arc<dyn MessageSink>,
    );
    manager.start().context("failed to start connection manager")?;
    for addr in manager.listen_addrs() {
        tracing::info!(%addr, "accepting connections");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    manager.stop().await;
    repository.shutdown().await;
    let _ = shutdown_tx.send(());
    if let Err(e) = recorder.await {
        tracing::error!(error = %e, "recorder task failed");
    }

    tracing::info!("lookoutd stopped");
    Ok(())
}
