//! Connection manager: owns every peer session and the listeners.
//!
//! Tasks:
//!   pacing     connect ticker (outbound admission), poll ticker, stats ticker
//!   lifecycle  consumes `PeerEvent`s: Connected / Ready / Stopped / Received
//!   listener   one accept loop per bound address
//!
//! The peer index is shared with the accept loops. Every insertion first
//! claims a slot from a counter bounded by `max_connected`; the slot is
//! returned when the entry leaves the index.

mod interfaces;
mod listener;

pub use interfaces::usable_addrs;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

use lookout_core::config::LookoutConfig;
use lookout_core::Message;
use lookout_services::Repository;

use crate::peer::{Peer, PeerConfig, PeerEvent, PeerState};
use crate::sink::MessageSink;

use listener::Listener;

/// Live sessions keyed by remote address.
pub type PeerIndex = Arc<DashMap<SocketAddr, Peer>>;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Accept inbound connections at all.
    pub listen: bool,
    /// Port for every listener. 0 = OS-assigned.
    pub listen_port: u16,
    /// Explicit bind addresses. Empty = every usable interface.
    pub listen_addrs: Vec<IpAddr>,
    /// Outbound attempts per second. 0 disables outbound dialing.
    pub connection_rate: u32,
    /// Ceiling on indexed peers, inbound and outbound together.
    pub max_connected: usize,
    /// Candidates drawn per outbound admission before giving up.
    pub candidate_retries: usize,
    /// Default 15s.
    pub poll_interval: Duration,
    /// Default 5s.
    pub stats_interval: Duration,
    /// Depth of the peer event queue.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_config(&LookoutConfig::default())
    }
}

impl ManagerConfig {
    pub fn from_config(config: &LookoutConfig) -> Self {
        Self {
            listen: config.network.listen,
            listen_port: config.network.listen_port,
            listen_addrs: config.network.listen_addrs.clone(),
            connection_rate: config.manager.connection_rate,
            max_connected: config.manager.max_connected,
            candidate_retries: config.manager.candidate_retries,
            poll_interval: Duration::from_secs(config.manager.poll_interval_secs.max(1)),
            stats_interval: Duration::from_secs(config.manager.stats_interval_secs.max(1)),
            event_capacity: 256,
        }
    }
}

/// Aggregate session counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounters {
    pub total: usize,
    /// Dialing, accepting or handshaking.
    pub pending: usize,
    pub connected: usize,
    pub ready: usize,
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// State reachable from every manager task.
pub(crate) struct Shared {
    config: ManagerConfig,
    peer_config: Arc<PeerConfig>,
    repository: Repository,
    sink: Arc<dyn MessageSink>,
    peers: PeerIndex,
    /// Claimed admission slots, never above `max_connected`.
    slots: AtomicUsize,
    events: mpsc::Sender<PeerEvent>,
    stopping: AtomicBool,
}

impl Shared {
    fn counters(&self) -> PeerCounters {
        let mut counters = PeerCounters::default();
        for entry in self.peers.iter() {
            counters.total += 1;
            match entry.value().state() {
                state if state.is_pending() => counters.pending += 1,
                PeerState::Connected => counters.connected += 1,
                PeerState::Ready => counters.ready += 1,
                _ => {}
            }
        }
        counters
    }

    fn at_capacity(&self) -> bool {
        self.slots.load(Ordering::SeqCst) >= self.config.max_connected
    }

    /// Claim a slot and index `peer` under `addr`. Fails when the ceiling is
    /// reached or the address is already indexed.
    fn index(&self, addr: SocketAddr, peer: &Peer) -> bool {
        let max = self.config.max_connected;
        if self
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return false;
        }
        match self.peers.entry(addr) {
            Entry::Occupied(_) => {
                self.slots.fetch_sub(1, Ordering::SeqCst);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(peer.clone());
                true
            }
        }
    }

    /// Drop `peer` from the index if it is the indexed session for its
    /// address, returning its slot.
    fn unindex(&self, peer: &Peer) -> bool {
        let removed = self
            .peers
            .remove_if(&peer.addr(), |_, indexed| indexed.same(peer))
            .is_some();
        if removed {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    fn is_indexed(&self, peer: &Peer) -> bool {
        self.peers
            .get(&peer.addr())
            .map_or(false, |entry| entry.value().same(peer))
    }

    /// Outbound admission: draw a candidate not already indexed and dial it.
    async fn add_peer(&self) {
        if self.at_capacity() {
            return;
        }

        let mut candidate = None;
        for _ in 0..self.config.candidate_retries.max(1) {
            match self.repository.retrieve().await {
                None => return,
                Some(addr) if self.peers.contains_key(&addr) => continue,
                Some(addr) => {
                    candidate = Some(addr);
                    break;
                }
            }
        }
        let Some(addr) = candidate else {
            return;
        };

        let peer = Peer::outgoing(addr, self.peer_config.clone(), self.events.clone());
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        // Listeners may have filled the index while the repository answered.
        if !self.index(addr, &peer) {
            tracing::debug!(peer = %addr, "no slot for candidate, skipping");
            return;
        }
        if self.stopping.load(Ordering::SeqCst) {
            self.unindex(&peer);
            return;
        }

        tracing::debug!(peer = %addr, "dialing");
        self.repository.attempted(addr).await;
        peer.start();
    }

    async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected(peer) => {
                if !self.is_indexed(&peer) {
                    tracing::debug!(peer = %peer.addr(), "connected peer not indexed, dropping");
                    peer.disconnect();
                    return;
                }
                self.repository.connected(peer.addr()).await;
                tokio::spawn(async move { peer.greet().await });
            }

            PeerEvent::Ready(peer) => {
                self.repository.succeeded(peer.addr()).await;
            }

            PeerEvent::Stopped(peer) => {
                if self.unindex(&peer) {
                    tracing::debug!(peer = %peer.addr(), "peer removed");
                }
            }

            PeerEvent::Received(peer, message) => {
                if let Message::Addr(list) = &message {
                    for announced in list {
                        self.repository.discovered(announced.addr).await;
                    }
                }
                self.sink.deliver(peer.addr(), message).await;
            }
        }
    }

    fn ready_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state() == PeerState::Ready)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct Manager {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    listen_addrs: Mutex<Vec<SocketAddr>>,

    halt_pacing: broadcast::Sender<()>,
    halt_listeners: broadcast::Sender<()>,
    halt_lifecycle: broadcast::Sender<()>,

    pacing: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        peer_config: PeerConfig,
        repository: Repository,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (halt_pacing, _) = broadcast::channel(1);
        let (halt_listeners, _) = broadcast::channel(1);
        let (halt_lifecycle, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                config,
                peer_config: Arc::new(peer_config),
                repository,
                sink,
                peers: Arc::new(DashMap::new()),
                slots: AtomicUsize::new(0),
                events: events_tx,
                stopping: AtomicBool::new(false),
            }),
            events: Mutex::new(Some(events_rx)),
            listen_addrs: Mutex::new(Vec::new()),
            halt_pacing,
            halt_listeners,
            halt_lifecycle,
            pacing: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Bind listeners and launch the pacing and lifecycle loops.
    ///
    /// A listener that fails to bind is logged and skipped.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("manager already started");
        }

        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("peer event queue already taken"))?;
        let lifecycle = tokio::spawn(lifecycle_loop(
            self.shared.clone(),
            events,
            self.halt_lifecycle.subscribe(),
        ));
        *self.lifecycle.lock() = Some(lifecycle);

        if self.shared.config.listen {
            self.start_listeners()?;
        }

        let pacing = tokio::spawn(pacing_loop(self.shared.clone(), self.halt_pacing.subscribe()));
        *self.pacing.lock() = Some(pacing);

        tracing::info!(
            listeners = self.listen_addrs.lock().len(),
            max_connected = self.shared.config.max_connected,
            rate = self.shared.config.connection_rate,
            "connection manager started"
        );
        Ok(())
    }

    fn start_listeners(&self) -> Result<()> {
        let ips = if self.shared.config.listen_addrs.is_empty() {
            usable_addrs()?
        } else {
            self.shared.config.listen_addrs.clone()
        };

        for ip in ips {
            let addr = SocketAddr::new(ip, self.shared.config.listen_port);
            let bound = listener::bind(addr)
                .and_then(|l| Listener::new(l, self.shared.clone(), self.halt_listeners.subscribe()));
            match bound {
                Ok(listener) => {
                    self.listen_addrs.lock().push(listener.local_addr());
                    self.listeners.lock().push(tokio::spawn(listener.run()));
                }
                Err(e) => tracing::error!(%addr, error = %e, "failed to open listener"),
            }
        }
        Ok(())
    }

    /// Stop every peer, close listeners and join all tasks. Later calls
    /// return immediately.
    pub async fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(peers = self.shared.peers.len(), "connection manager stopping");

        let _ = self.halt_pacing.send(());
        let pacing = self.pacing.lock().take();
        join("pacing", pacing).await;

        stop_all(self.shared.snapshot()).await;

        let _ = self.halt_listeners.send(());
        let listeners: Vec<_> = self.listeners.lock().drain(..).collect();
        for task in listeners {
            join("listener", Some(task)).await;
        }
        self.listen_addrs.lock().clear();

        // Admitted while the first sweep was running.
        stop_all(self.shared.snapshot()).await;

        let _ = self.halt_lifecycle.send(());
        let lifecycle = self.lifecycle.lock().take();
        join("lifecycle", lifecycle).await;
        self.shared.peers.clear();
        self.shared.slots.store(0, Ordering::SeqCst);

        tracing::info!("connection manager stopped");
    }

    /// Addresses the listeners are bound to.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listen_addrs.lock().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<Peer> {
        self.shared.peers.get(addr).map(|entry| entry.value().clone())
    }

    pub fn counters(&self) -> PeerCounters {
        self.shared.counters()
    }

    pub fn repository(&self) -> &Repository {
        &self.shared.repository
    }
}

async fn stop_all(peers: Vec<Peer>) {
    futures::future::join_all(peers.iter().map(|peer| peer.stop())).await;
}

async fn join(name: &str, task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "manager task failed");
        }
    }
}

// ── Loops ─────────────────────────────────────────────────────────────────────

async fn pacing_loop(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let rate = shared.config.connection_rate;
    let connect_period = if rate == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_secs_f64(1.0 / f64::from(rate))
    };
    let mut connect = interval(connect_period);
    connect.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut poll = delayed(shared.config.poll_interval);
    let mut stats = delayed(shared.config.stats_interval);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = connect.tick(), if rate > 0 => shared.add_peer().await,

            _ = poll.tick() => {
                if shared.repository.poll_due().await {
                    let polled = shared
                        .ready_peers()
                        .iter()
                        .filter(|peer| peer.poll())
                        .count();
                    tracing::debug!(polled, "address book low, polled peers");
                }
            }

            _ = stats.tick() => {
                let c = shared.counters();
                tracing::info!(
                    total = c.total,
                    pending = c.pending,
                    connected = c.connected,
                    ready = c.ready,
                    "peer counters"
                );
            }
        }
    }

    tracing::debug!("pacing loop stopped");
}

/// Ticker whose first tick is one period away. Zero is raised to 1ms.
fn delayed(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn lifecycle_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<PeerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event).await,
                None => break,
            },
        }
    }

    tracing::debug!("lifecycle loop stopped");
}
