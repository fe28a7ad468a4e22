//! Peer session: one TCP connection to a remote node.
//!
//! A [`Peer`] is a cheap cloneable handle. The Manager keeps one clone in
//! its index and receives others inside [`PeerEvent`]s.
//!
//! Lifecycle:
//!   Idle → Dialing (outbound) / Accepting (inbound) → Handshaking
//!        → Connected → Ready → Stopped
//!
//! After the handshake three loops run per session (see `session.rs`):
//! send, receive and dispatch. Any of them exiting takes the others down.
//! `Stopped` is reported exactly once, whichever path ends the session.

mod handshake;
mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use lookout_core::config::{NetworkConfig, PeerSettings};
use lookout_core::message::NetAddress;
use lookout_core::{CodecError, Message, MessageCodec, Network, VersionMessage};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Settings shared by every session of one node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub network: Network,
    /// Highest protocol version we speak.
    pub protocol_version: u32,
    /// Service bits we advertise.
    pub services: u64,
    pub user_agent: String,
    /// Node-wide nonce. A remote `version` carrying it means we dialed ourselves.
    pub nonce: u64,
    /// Default 1s.
    pub dial_timeout: Duration,
    /// Default 10s.
    pub handshake_timeout: Duration,
    /// Default 1s.
    pub write_timeout: Duration,
    /// Default 1s.
    pub read_timeout: Duration,
    /// Ping after this long without sending. Default 1min.
    pub ping_interval: Duration,
    /// Disconnect after this long without receiving. Default 3min.
    pub idle_timeout: Duration,
}

impl PeerConfig {
    /// Defaults for `network` with a freshly generated nonce.
    pub fn new(network: Network) -> Self {
        let mut net = NetworkConfig::default();
        net.network = network;
        Self::from_settings(&net, &PeerSettings::default())
    }

    pub fn from_settings(network: &NetworkConfig, peer: &PeerSettings) -> Self {
        Self {
            network: network.network,
            protocol_version: network.protocol_version,
            services: network.services,
            user_agent: network.user_agent.clone(),
            nonce: rand::random(),
            dial_timeout: Duration::from_millis(peer.dial_timeout_ms),
            handshake_timeout: Duration::from_millis(peer.handshake_timeout_ms),
            write_timeout: Duration::from_millis(peer.write_timeout_ms),
            read_timeout: Duration::from_millis(peer.read_timeout_ms),
            ping_interval: Duration::from_secs(peer.ping_interval_secs),
            idle_timeout: Duration::from_secs(peer.idle_timeout_secs),
        }
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Idle = 0,
    Dialing = 1,
    Accepting = 2,
    Handshaking = 3,
    Connected = 4,
    Ready = 5,
    Stopped = 6,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Idle,
            1 => PeerState::Dialing,
            2 => PeerState::Accepting,
            3 => PeerState::Handshaking,
            4 => PeerState::Connected,
            5 => PeerState::Ready,
            _ => PeerState::Stopped,
        }
    }

    /// Not yet through the handshake.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            PeerState::Idle | PeerState::Dialing | PeerState::Accepting | PeerState::Handshaking
        )
    }
}

/// Session failures. These never leave the session: they are logged and
/// turned into `Stopped`.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("dial timed out")]
    DialTimeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connected to self")]
    SelfConnection,

    #[error("unexpected {0} during handshake")]
    Unexpected(String),

    #[error("connection closed by remote")]
    Closed,

    #[error("session stopped")]
    Stopped,
}

/// Lifecycle notifications and forwarded traffic, in per-session order.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake complete.
    Connected(Peer),
    /// `greet` finished; the peer is in normal message flow.
    Ready(Peer),
    /// Terminal. Sent exactly once per session.
    Stopped(Peer),
    /// An `addr`, `inv`, `tx` or `block` message from the peer.
    Received(Peer, Message),
}

pub type EventSender = mpsc::Sender<PeerEvent>;

type Reader = FramedRead<OwnedReadHalf, MessageCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

/// Resolves once the flag behind `rx` is set.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

// ── Peer ──────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

struct Inner {
    addr: SocketAddr,
    direction: Direction,
    config: Arc<PeerConfig>,
    events: EventSender,

    state: AtomicU8,
    /// Negotiated protocol version. 0 until the handshake completes.
    version: AtomicU32,
    remote: Mutex<Option<VersionMessage>>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Accepted connection waiting for `start`.
    stream: Mutex<Option<TcpStream>>,

    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    started: AtomicBool,
    done: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.inner.addr)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// A session that will dial `addr` when started.
    pub fn outgoing(addr: SocketAddr, config: Arc<PeerConfig>, events: EventSender) -> Self {
        Self::build(addr, Direction::Outbound, None, None, config, events)
    }

    /// A session over an already accepted connection.
    pub fn incoming(
        stream: TcpStream,
        config: Arc<PeerConfig>,
        events: EventSender,
    ) -> std::io::Result<Self> {
        let addr = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let peer = Self::build(addr, Direction::Inbound, Some(local), Some(stream), config, events);
        peer.set_state(PeerState::Accepting);
        Ok(peer)
    }

    fn build(
        addr: SocketAddr,
        direction: Direction,
        local_addr: Option<SocketAddr>,
        stream: Option<TcpStream>,
        config: Arc<PeerConfig>,
        events: EventSender,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                addr,
                direction,
                config,
                events,
                state: AtomicU8::new(PeerState::Idle as u8),
                version: AtomicU32::new(0),
                remote: Mutex::new(None),
                local_addr: Mutex::new(local_addr),
                stream: Mutex::new(stream),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                shutdown,
                stopped,
                started: AtomicBool::new(false),
                done: AtomicBool::new(false),
            }),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Our end of the connection, once there is one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// min(our version, theirs). `None` before the handshake completes.
    pub fn protocol_version(&self) -> Option<u32> {
        match self.inner.version.load(Ordering::Acquire) {
            0 => None,
            v => Some(v),
        }
    }

    /// The `version` message the remote sent.
    pub fn remote_version(&self) -> Option<VersionMessage> {
        self.inner.remote.lock().clone()
    }

    /// Whether two handles refer to the same session.
    pub fn same(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_state(&self, state: PeerState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    // ── Control ───────────────────────────────────────────────────────────

    /// Spawn the session driver. Later calls, and calls after `stop`, do nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = self.clone();
        tokio::spawn(async move { peer.drive().await });
    }

    /// Post-handshake greeting: ask for addresses, then report `Ready`.
    pub async fn greet(&self) {
        if self.send(Message::GetAddr).await.is_err() {
            return;
        }
        let promoted = self.inner.state.compare_exchange(
            PeerState::Connected as u8,
            PeerState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if promoted.is_ok() {
            tracing::debug!(peer = %self.addr(), "peer ready");
            self.emit(PeerEvent::Ready(self.clone())).await;
        }
    }

    /// Queue a message. Waits while the previous message is still pending.
    pub async fn send(&self, message: Message) -> Result<(), PeerError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            _ = signalled(&mut shutdown) => Err(PeerError::Stopped),
            sent = self.inner.outbound_tx.send(message) => sent.map_err(|_| PeerError::Stopped),
        }
    }

    /// Ask for addresses. Skipped if the outbound slot is occupied.
    pub fn poll(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.inner.outbound_tx.try_send(Message::GetAddr).is_ok()
    }

    /// Signal the session to end without waiting for it.
    pub fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Signal the session to end and wait until it has reported `Stopped`.
    pub async fn stop(&self) {
        self.disconnect();
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            // Never started: nothing else will finish it.
            self.finish().await;
        }
        signalled(&mut self.inner.stopped.subscribe()).await;
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    async fn emit(&self, event: PeerEvent) {
        if self.inner.events.send(event).await.is_err() {
            tracing::trace!(peer = %self.addr(), "event receiver gone");
        }
    }

    /// Report `Stopped` once and release waiters.
    async fn finish(&self) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(PeerState::Stopped);
        self.inner.shutdown.send_replace(true);
        self.inner.stream.lock().take();
        self.emit(PeerEvent::Stopped(self.clone())).await;
        self.inner.stopped.send_replace(true);
        tracing::debug!(peer = %self.addr(), "peer stopped");
    }

    // ── Driver ────────────────────────────────────────────────────────────

    async fn drive(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let established = tokio::select! {
            _ = signalled(&mut shutdown) => Err(PeerError::Stopped),
            result = self.establish() => result,
        };

        match established {
            Ok((reader, writer)) => {
                self.set_state(PeerState::Connected);
                tracing::info!(
                    peer = %self.addr(),
                    direction = ?self.direction(),
                    version = self.protocol_version().unwrap_or_default(),
                    "handshake complete"
                );
                self.emit(PeerEvent::Connected(self.clone())).await;
                self.run_session(reader, writer).await;
            }
            Err(PeerError::Stopped) => {}
            Err(e) => tracing::debug!(peer = %self.addr(), error = %e, "session failed"),
        }

        self.finish().await;
    }

    async fn establish(&self) -> Result<(Reader, Writer), PeerError> {
        let config = &self.inner.config;

        let taken = self.inner.stream.lock().take();
        let stream = match taken {
            Some(stream) => stream,
            None => {
                self.set_state(PeerState::Dialing);
                let stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(self.addr()))
                    .await
                    .map_err(|_| PeerError::DialTimeout)??;
                *self.inner.local_addr.lock() = stream.local_addr().ok();
                stream
            }
        };
        stream.set_nodelay(true)?;

        self.set_state(PeerState::Handshaking);
        let codec = MessageCodec::new(config.network);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec.clone());
        let mut writer = FramedWrite::new(write_half, codec);

        let local = self.local_version();
        let exchange = async {
            match self.direction() {
                Direction::Outbound => handshake::initiate(&mut reader, &mut writer, local).await,
                Direction::Inbound => handshake::respond(&mut reader, &mut writer, local).await,
            }
        };
        let remote = tokio::time::timeout(config.handshake_timeout, exchange)
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        let version = config.protocol_version.min(remote.version);
        reader.decoder_mut().set_version(version);
        writer.encoder_mut().set_version(version);
        self.inner.version.store(version, Ordering::Release);
        *self.inner.remote.lock() = Some(remote);

        Ok((reader, writer))
    }

    fn local_version(&self) -> VersionMessage {
        let config = &self.inner.config;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let sender = self
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        VersionMessage {
            version: config.protocol_version,
            services: config.services,
            timestamp,
            receiver: NetAddress::new(self.addr(), 0),
            sender: NetAddress::new(sender, config.services),
            nonce: config.nonce,
            user_agent: config.user_agent.clone(),
            start_height: 0,
            relay: true,
        }
    }
}
