//! Address repository: the crawler's address book.
//!
//! A single actor task owns the node index. Every operation is a message
//! on one bounded queue, processed in arrival order, so the index needs no
//! lock: `attempted` followed by `succeeded` for the same address always
//! applies in that order.
//!
//! Updates (`discovered`, `attempted`, `connected`, `succeeded`) return as
//! soon as the request is queued. `retrieve` waits for the actor's answer.
//!
//! The actor also persists the index on a timer and re-bootstraps from DNS
//! seeds on a slower timer. DNS and disk I/O run inside the actor task.

mod node;
mod seeds;
mod store;

pub use node::{Node, RetrievalPolicy};
pub use seeds::{DnsResolver, SeedResolver, StaticResolver};
pub use store::{JsonFileStore, MemoryStore, NodeStore};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::Instrument;

use lookout_core::config::RepositorySettings;
use lookout_core::Network;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Eligibility filter applied by `retrieve`.
    pub policy: RetrievalPolicy,
    /// Seed hostnames queried on bootstrap.
    pub seeds: Vec<String>,
    /// Default 90s.
    pub backup_interval: Duration,
    /// Default 30min.
    pub bootstrap_interval: Duration,
    /// Upper bound on tracked nodes. 0 = unbounded.
    pub max_nodes: usize,
    /// `poll_due` reports true while fewer candidates than this are eligible.
    pub low_watermark: usize,
    /// Depth of the request queue.
    pub queue_capacity: usize,
}

impl RepositoryConfig {
    /// Defaults for `network`: its port and its built-in seeds.
    pub fn for_network(network: Network) -> Self {
        Self::from_settings(network, &RepositorySettings::default())
    }

    pub fn from_settings(network: Network, settings: &RepositorySettings) -> Self {
        let seeds = if settings.seeds.is_empty() {
            network.dns_seeds().iter().map(|s| s.to_string()).collect()
        } else {
            settings.seeds.clone()
        };
        Self {
            policy: RetrievalPolicy {
                default_port: network.default_port(),
                max_attempts: settings.max_attempts,
                cooldown: Duration::from_secs(settings.cooldown_secs),
                success_recency: Duration::from_secs(settings.success_recency_secs),
            },
            seeds,
            backup_interval: Duration::from_secs(settings.backup_interval_secs.max(1)),
            bootstrap_interval: Duration::from_secs(settings.bootstrap_interval_secs.max(1)),
            max_nodes: settings.max_nodes,
            low_watermark: settings.low_watermark,
            queue_capacity: 1024,
        }
    }
}

/// Counters reported by [`Repository::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub total: usize,
    pub eligible: usize,
    pub poll_due: bool,
}

// ── Handle ────────────────────────────────────────────────────────────────────

enum Request {
    Discovered(SocketAddr),
    Attempted(SocketAddr),
    Connected(SocketAddr),
    Succeeded(SocketAddr),
    Retrieve(oneshot::Sender<Option<SocketAddr>>),
    Lookup(SocketAddr, oneshot::Sender<Option<Node>>),
    Snapshot(oneshot::Sender<Vec<Node>>),
    Stats(oneshot::Sender<RepositoryStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the repository actor.
#[derive(Clone)]
pub struct Repository {
    requests: mpsc::Sender<Request>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl Repository {
    /// Start the actor. Restores from `store`, bootstrapping from DNS if
    /// the restored index is empty.
    pub fn spawn<S, R>(config: RepositoryConfig, store: S, resolver: R) -> Self
    where
        S: NodeStore,
        R: SeedResolver,
    {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let actor = Actor {
            config,
            store,
            resolver,
            nodes: HashMap::new(),
        };
        let task = tokio::spawn(actor.run(rx).instrument(tracing::info_span!("repository")));
        Self {
            requests: tx,
            task: Arc::new(Mutex::new(Some(task))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An address was announced to us.
    pub async fn discovered(&self, addr: SocketAddr) {
        self.submit(Request::Discovered(addr)).await;
    }

    /// A connection to `addr` is being attempted.
    pub async fn attempted(&self, addr: SocketAddr) {
        self.submit(Request::Attempted(addr)).await;
    }

    /// The handshake with `addr` completed.
    pub async fn connected(&self, addr: SocketAddr) {
        self.submit(Request::Connected(addr)).await;
    }

    /// `addr` was admitted as a fully working peer.
    pub async fn succeeded(&self, addr: SocketAddr) {
        self.submit(Request::Succeeded(addr)).await;
    }

    /// One eligible candidate, or `None` if nothing qualifies.
    pub async fn retrieve(&self) -> Option<SocketAddr> {
        self.ask(Request::Retrieve).await.flatten()
    }

    /// Current record for `addr`.
    pub async fn lookup(&self, addr: SocketAddr) -> Option<Node> {
        self.ask(|tx| Request::Lookup(addr, tx)).await.flatten()
    }

    /// Copy of the whole index.
    pub async fn snapshot(&self) -> Vec<Node> {
        self.ask(Request::Snapshot).await.unwrap_or_default()
    }

    pub async fn stats(&self) -> RepositoryStats {
        self.ask(Request::Stats).await.unwrap_or_default()
    }

    /// Whether the candidate pool is low enough that peers should be
    /// asked for more addresses.
    pub async fn poll_due(&self) -> bool {
        self.stats().await.poll_due
    }

    /// Stop the actor after a final save. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "repository task failed");
            }
        }
    }

    async fn submit(&self, request: Request) {
        if self.requests.send(request).await.is_err() {
            tracing::debug!("repository closed, request dropped");
        }
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(make(tx)).await.is_err() {
            return None;
        }
        rx.await.ok()
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct Actor<S, R> {
    config: RepositoryConfig,
    store: S,
    resolver: R,
    nodes: HashMap<SocketAddr, Node>,
}

impl<S: NodeStore, R: SeedResolver> Actor<S, R> {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        self.restore();
        if self.nodes.is_empty() {
            self.bootstrap().await;
        }

        let mut backup = timer(self.config.backup_interval);
        let mut bootstrap = timer(self.config.bootstrap_interval);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        if let ControlFlow::Break(ack) = self.handle(request) {
                            requests.close();
                            self.save();
                            let _ = ack.send(());
                            break;
                        }
                    }
                    None => {
                        self.save();
                        break;
                    }
                },

                _ = backup.tick() => self.save(),

                _ = bootstrap.tick() => self.bootstrap().await,
            }
        }

        tracing::info!(nodes = self.nodes.len(), "address repository stopped");
    }

    /// Apply one request. Breaks with the acknowledgement on shutdown.
    fn handle(&mut self, request: Request) -> ControlFlow<oneshot::Sender<()>> {
        match request {
            Request::Discovered(addr) => self.discovered(canonical(addr)),
            Request::Attempted(addr) => {
                self.update(addr, "attempted", |node, now| {
                    node.num_attempts += 1;
                    node.last_attempted = Some(now);
                });
            }
            Request::Connected(addr) => {
                self.update(addr, "connected", |node, now| {
                    node.last_connected = Some(now);
                });
            }
            Request::Succeeded(addr) => {
                self.update(addr, "succeeded", |node, now| {
                    node.num_attempts = 0;
                    node.last_succeeded = Some(now);
                });
            }
            Request::Retrieve(reply) => {
                let _ = reply.send(self.retrieve());
            }
            Request::Lookup(addr, reply) => {
                let _ = reply.send(self.nodes.get(&canonical(addr)).cloned());
            }
            Request::Snapshot(reply) => {
                let _ = reply.send(self.nodes.values().cloned().collect());
            }
            Request::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Request::Shutdown(ack) => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    fn discovered(&mut self, addr: SocketAddr) {
        let now = SystemTime::now();
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.num_seen += 1;
            node.last_seen = Some(now);
            return;
        }

        if self.config.max_nodes > 0 && self.nodes.len() >= self.config.max_nodes {
            self.evict_stalest();
        }
        self.nodes.insert(addr, Node::new(addr, now));
        tracing::trace!(%addr, "node discovered");
    }

    fn update(&mut self, addr: SocketAddr, event: &'static str, apply: impl FnOnce(&mut Node, SystemTime)) {
        let addr = canonical(addr);
        match self.nodes.get_mut(&addr) {
            Some(node) => apply(node, SystemTime::now()),
            None => tracing::warn!(%addr, event, "update for unknown address ignored"),
        }
    }

    fn retrieve(&self) -> Option<SocketAddr> {
        let now = SystemTime::now();
        self.nodes
            .values()
            .filter(|node| node.is_eligible(now, &self.config.policy))
            .map(|node| node.address)
            .choose(&mut rand::thread_rng())
    }

    fn stats(&self) -> RepositoryStats {
        let now = SystemTime::now();
        let eligible = self
            .nodes
            .values()
            .filter(|node| node.is_eligible(now, &self.config.policy))
            .count();
        RepositoryStats {
            total: self.nodes.len(),
            eligible,
            poll_due: eligible < self.config.low_watermark,
        }
    }

    fn evict_stalest(&mut self) {
        let victim = self
            .nodes
            .values()
            .min_by_key(|node| node.last_seen)
            .map(|node| node.address);
        if let Some(addr) = victim {
            self.nodes.remove(&addr);
            tracing::debug!(%addr, "evicted stalest node");
        }
    }

    /// Keep only the `max_nodes` most recently seen nodes.
    fn trim_to_capacity(&mut self) {
        let max = self.config.max_nodes;
        if max == 0 || self.nodes.len() <= max {
            return;
        }
        let mut nodes: Vec<Node> = self.nodes.drain().map(|(_, node)| node).collect();
        nodes.sort_by_key(|node| std::cmp::Reverse(node.last_seen));
        let dropped = nodes.len() - max;
        nodes.truncate(max);
        self.nodes = nodes.into_iter().map(|node| (node.address, node)).collect();
        tracing::warn!(dropped, max_nodes = max, "restored index over capacity, dropped stalest nodes");
    }

    async fn bootstrap(&mut self) {
        let port = self.config.policy.default_port;
        let before = self.nodes.len();

        for seed in self.config.seeds.clone() {
            match self.resolver.resolve(&seed, port).await {
                Ok(addrs) => {
                    tracing::info!(seed = %seed, count = addrs.len(), "resolved DNS seed");
                    for addr in addrs {
                        self.discovered(canonical(SocketAddr::new(addr.ip(), port)));
                    }
                }
                Err(e) => tracing::warn!(seed = %seed, error = %e, "failed to resolve DNS seed"),
            }
        }

        tracing::info!(
            added = self.nodes.len().saturating_sub(before),
            total = self.nodes.len(),
            "bootstrap complete"
        );
    }

    fn restore(&mut self) {
        match self.store.load() {
            Ok(nodes) => {
                for mut node in nodes {
                    node.address = canonical(node.address);
                    match self.nodes.get(&node.address) {
                        Some(kept) if kept.last_seen >= node.last_seen => {}
                        _ => {
                            self.nodes.insert(node.address, node);
                        }
                    }
                }
                self.trim_to_capacity();
                tracing::info!(nodes = self.nodes.len(), "node index restored");
            }
            Err(e) => tracing::warn!(error = %e, "failed to restore node index"),
        }
    }

    fn save(&self) {
        let nodes: Vec<Node> = self.nodes.values().cloned().collect();
        match self.store.save(&nodes) {
            Ok(()) => tracing::debug!(nodes = nodes.len(), "node index saved"),
            Err(e) => tracing::warn!(error = %e, "failed to save node index"),
        }
    }
}

/// Delayed-start ticker. A zero period is raised to one millisecond.
fn timer(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// IPv4-mapped IPv6 addresses are keyed by their IPv4 form.
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn config(seeds: &[&str]) -> RepositoryConfig {
        let mut config = RepositoryConfig::for_network(Network::Testnet);
        config.seeds = seeds.iter().map(|s| s.to_string()).collect();
        config
    }

    fn empty_repository() -> Repository {
        Repository::spawn(config(&[]), MemoryStore::new(), StaticResolver::new())
    }

    /// Counts saves so tests can assert the final flush happens once.
    #[derive(Clone, Default)]
    struct CountingStore {
        saves: Arc<AtomicUsize>,
        inner: MemoryStore,
    }

    impl NodeStore for CountingStore {
        fn load(&self) -> anyhow::Result<Vec<Node>> {
            self.inner.load()
        }

        fn save(&self, nodes: &[Node]) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(nodes)
        }
    }

    #[tokio::test]
    async fn discovering_twice_counts_one_node() {
        let repo = empty_repository();
        let a = addr("10.0.0.1:18333");
        repo.discovered(a).await;
        repo.discovered(a).await;

        let nodes = repo.snapshot().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].num_seen, 2);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn mapped_addresses_share_a_node() {
        let repo = empty_repository();
        repo.discovered(addr("10.0.0.1:18333")).await;
        repo.discovered(addr("[::ffff:10.0.0.1]:18333")).await;
        assert_eq!(repo.snapshot().await.len(), 1);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn success_resets_attempts() {
        let repo = empty_repository();
        let a = addr("10.0.0.1:18333");
        repo.discovered(a).await;
        for _ in 0..5 {
            repo.attempted(a).await;
        }
        assert_eq!(repo.lookup(a).await.unwrap().num_attempts, 5);

        repo.connected(a).await;
        repo.succeeded(a).await;
        let node = repo.lookup(a).await.unwrap();
        assert_eq!(node.num_attempts, 0);
        assert!(node.last_attempted.is_some());
        assert!(node.last_connected.is_some());
        assert!(node.last_succeeded.is_some());
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn updates_for_unknown_addresses_are_ignored() {
        let repo = empty_repository();
        let a = addr("10.0.0.9:18333");
        repo.attempted(a).await;
        repo.connected(a).await;
        repo.succeeded(a).await;
        assert!(repo.lookup(a).await.is_none());
        assert!(repo.snapshot().await.is_empty());
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_candidates_cool_down_after_attempt() {
        let first = addr("10.0.0.1:18333");
        let second = addr("10.0.0.2:18333");
        let resolver = StaticResolver::new().with_seed("seed.example", vec![first, second]);
        let repo = Repository::spawn(config(&["seed.example"]), MemoryStore::new(), resolver);

        let picked = repo.retrieve().await.expect("bootstrap should yield candidates");
        assert!(picked == first || picked == second);

        repo.attempted(picked).await;
        let next = repo.retrieve().await.expect("the other seed address remains");
        assert_ne!(next, picked);

        repo.attempted(next).await;
        assert_eq!(repo.retrieve().await, None);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn failing_seed_is_skipped() {
        let good = addr("10.0.0.5:18333");
        let resolver = StaticResolver::new().with_seed("good.example", vec![good]);
        let repo = Repository::spawn(
            config(&["bad.example", "good.example"]),
            MemoryStore::new(),
            resolver,
        );

        let nodes = repo.snapshot().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, good);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn seed_addresses_use_the_network_port() {
        let resolver =
            StaticResolver::new().with_seed("seed.example", vec![addr("10.0.0.7:1")]);
        let repo = Repository::spawn(config(&["seed.example"]), MemoryStore::new(), resolver);
        assert_eq!(repo.retrieve().await, Some(addr("10.0.0.7:18333")));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn restored_index_skips_bootstrap() {
        let saved = Node::new(addr("10.0.0.3:18333"), SystemTime::now());
        let store = MemoryStore::with_nodes(vec![saved.clone()]);
        let resolver =
            StaticResolver::new().with_seed("seed.example", vec![addr("10.0.0.4:18333")]);
        let repo = Repository::spawn(config(&["seed.example"]), store, resolver);

        assert_eq!(repo.snapshot().await, vec![saved]);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_index_restores_identically() {
        let store = MemoryStore::new();
        let repo = Repository::spawn(config(&[]), store.clone(), StaticResolver::new());
        let a = addr("10.0.0.1:18333");
        let b = addr("[2001:db8::1]:18333");
        repo.discovered(a).await;
        repo.discovered(b).await;
        repo.discovered(b).await;
        repo.attempted(a).await;
        repo.connected(a).await;
        repo.succeeded(a).await;
        repo.attempted(b).await;

        let mut before = repo.snapshot().await;
        repo.shutdown().await;

        let restored = Repository::spawn(config(&[]), store, StaticResolver::new());
        let mut after = restored.snapshot().await;
        before.sort_by_key(|n| n.address);
        after.sort_by_key(|n| n.address);
        assert_eq!(before, after);
        restored.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_shutdown_flushes_once() {
        let store = CountingStore::default();
        let repo = Repository::spawn(config(&[]), store.clone(), StaticResolver::new());
        repo.discovered(addr("10.0.0.1:18333")).await;

        let other = repo.clone();
        tokio::join!(repo.shutdown(), other.shutdown(), repo.shutdown());
        repo.shutdown().await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.contents().len(), 1);
        assert_eq!(repo.retrieve().await, None);
    }

    #[tokio::test]
    async fn capacity_bound_evicts_stalest() {
        let mut cfg = config(&[]);
        cfg.max_nodes = 2;
        let repo = Repository::spawn(cfg, MemoryStore::new(), StaticResolver::new());

        let (a, b, c) = (
            addr("10.0.0.1:18333"),
            addr("10.0.0.2:18333"),
            addr("10.0.0.3:18333"),
        );
        repo.discovered(a).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        repo.discovered(b).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        repo.discovered(c).await;

        let mut kept: Vec<_> = repo.snapshot().await.into_iter().map(|n| n.address).collect();
        kept.sort();
        assert_eq!(kept, vec![b, c]);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn restore_applies_capacity_and_canonical_keys() {
        let now = SystemTime::now();
        let aged = |s: &str, secs: u64| Node::new(addr(s), now - Duration::from_secs(secs));
        let store = MemoryStore::with_nodes(vec![
            aged("10.0.0.1:18333", 30),
            aged("10.0.0.2:18333", 20),
            aged("[::ffff:10.0.0.3]:18333", 10),
            aged("10.0.0.3:18333", 40),
        ]);
        let mut cfg = config(&[]);
        cfg.max_nodes = 2;
        let repo = Repository::spawn(cfg, store, StaticResolver::new());

        let mut kept: Vec<_> = repo.snapshot().await.into_iter().map(|n| n.address).collect();
        kept.sort();
        assert_eq!(kept, vec![addr("10.0.0.2:18333"), addr("10.0.0.3:18333")]);
        let merged = repo.lookup(addr("10.0.0.3:18333")).await.unwrap();
        assert_eq!(merged.last_seen, Some(now - Duration::from_secs(10)));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn zero_backup_interval_keeps_the_actor_running() {
        let mut settings = RepositorySettings::default();
        settings.backup_interval_secs = 0;
        settings.bootstrap_interval_secs = 0;
        let from_file = RepositoryConfig::from_settings(Network::Testnet, &settings);
        assert_eq!(from_file.backup_interval, Duration::from_secs(1));
        assert_eq!(from_file.bootstrap_interval, Duration::from_secs(1));

        let mut cfg = config(&[]);
        cfg.backup_interval = Duration::ZERO;
        cfg.bootstrap_interval = Duration::ZERO;
        let repo = Repository::spawn(cfg, MemoryStore::new(), StaticResolver::new());
        repo.discovered(addr("10.0.0.1:18333")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(repo.snapshot().await.len(), 1);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn poll_due_tracks_low_watermark() {
        let mut cfg = config(&[]);
        cfg.low_watermark = 2;
        let repo = Repository::spawn(cfg, MemoryStore::new(), StaticResolver::new());
        assert!(repo.poll_due().await);

        repo.discovered(addr("10.0.0.1:18333")).await;
        repo.discovered(addr("10.0.0.2:18333")).await;
        let stats = repo.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.eligible, 2);
        assert!(!stats.poll_due);
        repo.shutdown().await;
    }
}
