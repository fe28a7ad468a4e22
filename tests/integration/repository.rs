//! Address repository bootstrap and persistence across restarts.

use std::net::SocketAddr;

use lookout_services::{JsonFileStore, Repository, RepositoryConfig, StaticResolver};

use crate::*;

fn seeded_config() -> RepositoryConfig {
    let mut config = RepositoryConfig::for_network(lookout_core::Network::Testnet);
    config.seeds = vec!["seed.lookout.test".into()];
    config
}

fn seed_resolver() -> StaticResolver {
    StaticResolver::new().with_seed(
        "seed.lookout.test",
        vec![
            "10.0.0.1:18333".parse().unwrap(),
            "10.0.0.2:18333".parse().unwrap(),
        ],
    )
}

/// Empty book bootstraps from DNS; an attempted candidate is not handed
/// out again inside its cooldown.
#[tokio::test]
async fn test_bootstrap_then_cooldown() {
    let dir = temp_dir("bootstrap");
    let store = JsonFileStore::new(dir.join("nodes.json"));
    let repo = Repository::spawn(seeded_config(), store, seed_resolver());

    let seeds: [SocketAddr; 2] = [
        "10.0.0.1:18333".parse().unwrap(),
        "10.0.0.2:18333".parse().unwrap(),
    ];
    let first = repo.retrieve().await.expect("bootstrap candidates");
    assert!(seeds.contains(&first));

    repo.attempted(first).await;
    for _ in 0..20 {
        assert_ne!(repo.retrieve().await, Some(first));
    }

    repo.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Shutdown flushes to disk; a fresh repository on the same file comes back
/// with identical records and skips the DNS bootstrap.
#[tokio::test]
async fn test_restart_restores_book_from_disk() {
    let dir = temp_dir("restart");
    let path = dir.join("nodes.json");

    let repo = Repository::spawn(seeded_config(), JsonFileStore::new(&path), seed_resolver());
    let a: SocketAddr = "10.0.0.1:18333".parse().unwrap();
    let gossip: SocketAddr = "[2001:db8::7]:18333".parse().unwrap();
    repo.discovered(gossip).await;
    repo.discovered(gossip).await;
    repo.attempted(a).await;
    repo.connected(a).await;
    repo.succeeded(a).await;
    repo.attempted(a).await;

    let mut before = repo.snapshot().await;
    tokio::join!(repo.shutdown(), repo.shutdown());
    assert!(path.exists());

    let restarted = Repository::spawn(
        seeded_config(),
        JsonFileStore::new(&path),
        StaticResolver::new(),
    );
    let mut after = restarted.snapshot().await;
    before.sort_by_key(|n| n.address);
    after.sort_by_key(|n| n.address);
    assert_eq!(before, after);
    assert_eq!(after.len(), 3);

    let restored = restarted.lookup(gossip).await.unwrap();
    assert_eq!(restored.num_seen, 2);
    let restored = restarted.lookup(a).await.unwrap();
    assert_eq!(restored.num_attempts, 1);
    assert!(restored.last_succeeded.is_some());

    restarted.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}
