//! Send, receive and dispatch loops of an established session.

use std::future::poll_fn;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};

use lookout_core::{CodecError, Message};

use super::{signalled, Peer, PeerEvent, Reader, Writer};

impl Peer {
    /// Run the three loops until one of them ends, then wait for the rest.
    pub(super) async fn run_session(&self, reader: Reader, writer: Writer) {
        let outbound = self.inner.outbound_rx.lock().take();
        let Some(outbound) = outbound else {
            tracing::warn!(peer = %self.addr(), "outbound queue already taken");
            return;
        };
        let (inbound_tx, inbound_rx) = mpsc::channel(1);

        let send = tokio::spawn(self.clone().send_loop(writer, outbound));
        let recv = tokio::spawn(self.clone().recv_loop(reader, inbound_tx));
        let dispatch = tokio::spawn(self.clone().dispatch_loop(inbound_rx));

        let (send, recv, dispatch) = tokio::join!(send, recv, dispatch);
        for (name, result) in [("send", send), ("recv", recv), ("dispatch", dispatch)] {
            if let Err(e) = result {
                tracing::error!(peer = %self.addr(), loop_name = name, error = %e, "session loop panicked");
            }
        }
    }

    async fn send_loop(self, mut writer: Writer, mut queue: mpsc::Receiver<Message>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let write_timeout = self.inner.config.write_timeout;
        let ping_interval = self.inner.config.ping_interval;
        let mut last_send = Instant::now();
        // A frame the writer had no room for, retried before the queue is read.
        let mut blocked: Option<Message> = None;
        // Encoded frames still sitting in the writer's buffer.
        let mut unflushed = false;

        loop {
            let message = match blocked.take() {
                Some(message) => message,
                None => tokio::select! {
                    _ = signalled(&mut shutdown) => break,

                    message = queue.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },

                    flushed = timeout(write_timeout, writer.flush()), if unflushed => {
                        match flushed {
                            Ok(Ok(())) => unflushed = false,
                            Ok(Err(e)) => {
                                tracing::debug!(peer = %self.addr(), error = %e, "flush failed");
                                break;
                            }
                            Err(_) => {}
                        }
                        continue;
                    }

                    _ = sleep_until(last_send + ping_interval) => {
                        if self.inner.outbound_tx.try_send(Message::Ping(rand::random())).is_ok() {
                            tracing::trace!(peer = %self.addr(), "idle, ping queued");
                        }
                        last_send = Instant::now();
                        continue;
                    }
                },
            };

            let command = message.command().to_string();
            let outcome = tokio::select! {
                _ = signalled(&mut shutdown) => break,
                outcome = write_frame(&mut writer, message, write_timeout) => outcome,
            };
            match outcome {
                WriteOutcome::Sent => {
                    last_send = Instant::now();
                    unflushed = false;
                    tracing::trace!(peer = %self.addr(), %command, "sent");
                }
                WriteOutcome::Buffered => {
                    last_send = Instant::now();
                    unflushed = true;
                    tracing::debug!(peer = %self.addr(), %command, "write timed out, frame buffered");
                }
                WriteOutcome::Blocked(message) => {
                    tracing::debug!(peer = %self.addr(), %command, "write timed out, retrying");
                    blocked = Some(message);
                }
                WriteOutcome::Failed(e) => {
                    tracing::debug!(peer = %self.addr(), error = %e, "write failed");
                    break;
                }
            }
        }

        self.disconnect();
    }

    async fn recv_loop(self, mut reader: Reader, inbound: mpsc::Sender<Message>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let read_timeout = self.inner.config.read_timeout;
        let idle_timeout = self.inner.config.idle_timeout;
        let mut last_recv = Instant::now();

        loop {
            let next = tokio::select! {
                _ = signalled(&mut shutdown) => break,
                next = timeout(read_timeout, reader.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    if last_recv.elapsed() >= idle_timeout {
                        tracing::info!(peer = %self.addr(), "no traffic, disconnecting");
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    tracing::debug!(peer = %self.addr(), "connection closed by remote");
                    break;
                }
                Ok(Some(Err(e))) => {
                    tracing::debug!(peer = %self.addr(), error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            last_recv = Instant::now();
            tokio::select! {
                _ = signalled(&mut shutdown) => break,
                queued = inbound.send(message) => {
                    if queued.is_err() {
                        break;
                    }
                }
            }
        }

        self.disconnect();
    }

    async fn dispatch_loop(self, mut inbound: mpsc::Receiver<Message>) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            let message = tokio::select! {
                _ = signalled(&mut shutdown) => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                Message::Ping(nonce) => {
                    if self.send(Message::Pong(nonce)).await.is_err() {
                        break;
                    }
                }
                Message::Addr(_) | Message::Inv(_) | Message::Tx(_) | Message::Block(_) => {
                    let event = PeerEvent::Received(self.clone(), message);
                    tokio::select! {
                        _ = signalled(&mut shutdown) => break,
                        sent = self.inner.events.send(event) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                other => {
                    tracing::trace!(peer = %self.addr(), command = other.command(), "ignored");
                }
            }
        }

        self.disconnect();
    }
}

enum WriteOutcome {
    /// Encoded and flushed.
    Sent,
    /// Encoded, flush still pending.
    Buffered,
    /// No room in the writer; the frame is handed back untouched.
    Blocked(Message),
    Failed(CodecError),
}

/// One write bounded by `limit` at each stage. A frame is either encoded
/// into the writer or returned, never dropped.
async fn write_frame(writer: &mut Writer, message: Message, limit: Duration) -> WriteOutcome {
    match timeout(limit, poll_fn(|cx| writer.poll_ready_unpin(cx))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return WriteOutcome::Failed(e),
        Err(_) => return WriteOutcome::Blocked(message),
    }
    if let Err(e) = writer.start_send_unpin(message) {
        return WriteOutcome::Failed(e);
    }
    match timeout(limit, writer.flush()).await {
        Ok(Ok(())) => WriteOutcome::Sent,
        Ok(Err(e)) => WriteOutcome::Failed(e),
        Err(_) => WriteOutcome::Buffered,
    }
}
