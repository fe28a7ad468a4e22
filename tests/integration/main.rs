//! Lookout integration test harness.
//!
//! Every test runs in-process over loopback TCP: real sessions, real
//! listeners, real codec. The remote end is either another lookout
//! component or a test-driven `MessageCodec` stream.
//!
//!   cargo test --test integration

mod manager;
mod repository;
mod sessions;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use lookout_core::message::NetAddress;
use lookout_core::{MessageCodec, Network, VersionMessage, PROTOCOL_VERSION};
use lookout_services::{MemoryStore, Repository, RepositoryConfig, StaticResolver};
use lookoutd::{Manager, ManagerConfig, NullSink, PeerConfig};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const NETWORK: Network = Network::Regtest;

pub type RemoteReader = FramedRead<OwnedReadHalf, MessageCodec>;
pub type RemoteWriter = FramedWrite<OwnedWriteHalf, MessageCodec>;

/// Framed halves over a raw stream, as the remote node would see them.
pub fn remote(stream: TcpStream) -> (RemoteReader, RemoteWriter) {
    let (r, w) = stream.into_split();
    (
        FramedRead::new(r, MessageCodec::new(NETWORK)),
        FramedWrite::new(w, MessageCodec::new(NETWORK)),
    )
}

/// A `version` announcement from a test-driven remote.
pub fn remote_version(nonce: u64) -> VersionMessage {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: 0,
        timestamp: 0,
        receiver: NetAddress::new(any, 0),
        sender: NetAddress::new(any, 0),
        nonce,
        user_agent: "/integration/".into(),
        start_height: 0,
        relay: true,
    }
}

pub fn peer_config() -> PeerConfig {
    PeerConfig::new(NETWORK)
}

/// Repository without seeds, using `port` as the dialable port.
pub fn repository_on(port: u16) -> Repository {
    let mut config = RepositoryConfig::for_network(NETWORK);
    config.seeds.clear();
    config.policy.default_port = port;
    Repository::spawn(config, MemoryStore::new(), StaticResolver::new())
}

/// Manager listening on loopback only.
pub fn loopback_manager(
    port: u16,
    rate: u32,
    max_connected: usize,
    repository: Repository,
) -> Manager {
    let config = ManagerConfig {
        listen: true,
        listen_port: port,
        listen_addrs: vec!["127.0.0.1".parse().unwrap()],
        connection_rate: rate,
        max_connected,
        ..ManagerConfig::default()
    };
    Manager::new(config, peer_config(), repository, Arc::new(NullSink))
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Poll `check` every 20ms until it holds or `secs` elapse.
pub async fn wait_until<F, Fut>(secs: u64, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not met within {secs}s")
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("lookout-it-{tag}-{}-{id}", std::process::id()))
}

#[cfg(test)]
mod harness_tests {
    use super::*;

    #[tokio::test]
    async fn wait_until_reports_timeouts() {
        assert!(wait_until(1, || async { true }).await.is_ok());
        assert!(wait_until(0, || async { false }).await.is_err());
    }
}
