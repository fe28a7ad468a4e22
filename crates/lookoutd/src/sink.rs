//! Output path for forwarded peer traffic.
//!
//! The Manager hands every forwarded message to a [`MessageSink`]. The
//! daemon uses a [`ChannelSink`] drained by a [`Recorder`], which runs
//! inventory through the [`Tracker`] and logs what is new.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use lookout_core::Message;
use lookout_services::Tracker;

#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn deliver(&self, from: SocketAddr, message: Message);
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl MessageSink for NullSink {
    async fn deliver(&self, _from: SocketAddr, _message: Message) {}
}

/// Bounded channel into a consumer task. Delivery waits while the channel is full.
pub struct ChannelSink {
    tx: mpsc::Sender<(SocketAddr, Message)>,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(SocketAddr, Message)>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, from: SocketAddr, message: Message) {
        if self.tx.send((from, message)).await.is_err() {
            tracing::trace!(peer = %from, "sink consumer gone, message dropped");
        }
    }
}

/// What the recorder made of one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub addresses: usize,
    pub new_transactions: usize,
    pub new_blocks: usize,
}

/// Consumes forwarded messages and deduplicates observed content.
pub struct Recorder {
    tracker: Arc<Tracker>,
    messages: mpsc::Receiver<(SocketAddr, Message)>,
    shutdown: broadcast::Receiver<()>,
}

impl Recorder {
    pub fn new(
        tracker: Arc<Tracker>,
        messages: mpsc::Receiver<(SocketAddr, Message)>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            tracker,
            messages,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                next = self.messages.recv() => match next {
                    Some((from, message)) => {
                        record(&self.tracker, from, &message);
                    }
                    None => break,
                },
            }
        }

        let (transactions, blocks) = self.tracker.counts();
        tracing::info!(transactions, blocks, "recorder stopped");
    }
}

/// Run one message through `tracker`.
pub fn record(tracker: &Tracker, from: SocketAddr, message: &Message) -> Recorded {
    let mut recorded = Recorded::default();
    match message {
        Message::Addr(list) => {
            recorded.addresses = list.len();
            tracing::info!(peer = %from, count = list.len(), "address announcement");
        }
        Message::Inv(items) => {
            for item in items.iter().filter(|item| tracker.observe_inventory(item)) {
                if item.is_tx() {
                    recorded.new_transactions += 1;
                    tracing::debug!(peer = %from, txid = %item.hash, "new transaction announced");
                } else if item.is_block() {
                    recorded.new_blocks += 1;
                    tracing::info!(peer = %from, hash = %item.hash, "new block announced");
                }
            }
        }
        Message::Tx(_) => {
            if let Some(txid) = message.content_hash() {
                if tracker.observe_tx(&txid) {
                    recorded.new_transactions = 1;
                    tracing::debug!(peer = %from, %txid, "new transaction");
                }
            }
        }
        Message::Block(_) => {
            if let Some(hash) = message.content_hash() {
                if tracker.observe_block(&hash) {
                    recorded.new_blocks = 1;
                    tracing::info!(peer = %from, %hash, "new block");
                }
            }
        }
        other => tracing::trace!(peer = %from, command = other.command(), "not recorded"),
    }
    recorded
}
