//! Inbound connection listener.
//!
//! One accept loop per bound address. An inbound session is kept only if it
//! claims a slot in the shared peer index.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::peer::Peer;

use super::Shared;

pub(super) struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: broadcast::Receiver<()>,
}

impl Listener {
    pub(super) fn new(
        listener: TcpListener,
        shared: Arc<Shared>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr().context("listener local_addr")?;
        Ok(Self {
            listener,
            local_addr,
            shared,
            shutdown,
        })
    }

    pub(super) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(super) async fn run(mut self) {
        tracing::info!(addr = %self.local_addr, "listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(addr = %self.local_addr, "listener shutting down");
                    return;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.admit(stream, remote).await,
                    Err(e) => {
                        tracing::error!(addr = %self.local_addr, error = %e, "accept failed, listener exiting");
                        return;
                    }
                },
            }
        }
    }

    async fn admit(&self, stream: TcpStream, remote: SocketAddr) {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        if shared.at_capacity() {
            tracing::debug!(peer = %remote, "at capacity, rejecting inbound connection");
            return;
        }

        let peer = match Peer::incoming(stream, shared.peer_config.clone(), shared.events.clone()) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "failed to set up inbound peer");
                return;
            }
        };

        if !shared.index(remote, &peer) {
            tracing::debug!(peer = %remote, "at capacity, rejecting inbound connection");
            return;
        }
        if shared.stopping.load(Ordering::SeqCst) {
            shared.unindex(&peer);
            return;
        }

        tracing::debug!(peer = %remote, "inbound connection admitted");
        peer.start();
        shared.repository.attempted(remote).await;
    }
}

/// Bind a listening TCP socket with SO_REUSEADDR.
pub(super) fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind({addr})"))?;
    socket.listen(1024).context("listen()")?;
    TcpListener::from_std(socket.into()).context("failed to register listener with runtime")
}
