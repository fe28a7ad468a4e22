//! Peer session behaviour against live loopback connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use lookout_core::Message;
use lookoutd::{Peer, PeerEvent, PeerState};

use crate::*;

/// Two sessions sharing one nonce dial each other: both must stop before
/// the handshake completes.
#[tokio::test]
async fn test_shared_nonce_sessions_both_stop() {
    let config = Arc::new(peer_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let outbound = Peer::outgoing(addr, config.clone(), tx.clone());
    outbound.start();

    let (accepted, _) = listener.accept().await.unwrap();
    let inbound = Peer::incoming(accepted, config, tx).unwrap();
    inbound.start();

    let mut stopped = Vec::new();
    while stopped.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("both sessions should stop");
        match event {
            Some(PeerEvent::Stopped(peer)) => stopped.push(peer),
            other => panic!("unexpected event before stop: {other:?}"),
        }
    }

    assert!(stopped.iter().any(|p| p.same(&outbound)));
    assert!(stopped.iter().any(|p| p.same(&inbound)));
    assert_eq!(outbound.protocol_version(), None);
    assert_eq!(inbound.protocol_version(), None);
    assert_eq!(outbound.state(), PeerState::Stopped);
    assert_eq!(inbound.state(), PeerState::Stopped);
}

/// Our own nonce echoed back: the session stops once, no matter how many
/// times it is asked to stop afterwards.
#[tokio::test]
async fn test_self_connection_reports_stopped_once() {
    let config = Arc::new(peer_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let peer = Peer::outgoing(addr, config.clone(), tx);
    peer.start();

    let (stream, _) = listener.accept().await.unwrap();
    let (mut reader, mut writer) = remote(stream);
    assert!(matches!(reader.next().await, Some(Ok(Message::Version(_)))));
    writer
        .send(Message::Version(remote_version(config.nonce)))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("self connection should be dropped");
    assert!(matches!(event, Some(PeerEvent::Stopped(_))));

    tokio::join!(peer.stop(), peer.stop(), peer.stop());
    peer.disconnect();

    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "no further lifecycle events expected");
    assert!(reader.next().await.map_or(true, |r| r.is_err()), "connection should be closed");
}

/// A Ready session with no outbound traffic pings exactly once per idle
/// interval and stays Ready.
#[tokio::test]
async fn test_idle_session_pings_once() {
    let mut config = peer_config();
    config.ping_interval = Duration::from_millis(400);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let peer = Peer::outgoing(addr, Arc::new(config), tx);
    peer.start();

    let (stream, _) = listener.accept().await.unwrap();
    let (mut reader, mut writer) = remote(stream);
    assert!(matches!(reader.next().await, Some(Ok(Message::Version(_)))));
    writer.send(Message::Version(remote_version(7))).await.unwrap();
    assert!(matches!(reader.next().await, Some(Ok(Message::Verack))));
    writer.send(Message::Verack).await.unwrap();

    assert!(matches!(rx.recv().await, Some(PeerEvent::Connected(_))));
    peer.greet().await;
    assert!(matches!(rx.recv().await, Some(PeerEvent::Ready(_))));
    assert!(matches!(reader.next().await, Some(Ok(Message::GetAddr))));

    let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
    let mut pings = 0;
    while let Ok(next) = tokio::time::timeout_at(deadline, reader.next()).await {
        match next {
            Some(Ok(Message::Ping(_))) => pings += 1,
            other => panic!("unexpected traffic: {other:?}"),
        }
    }

    assert_eq!(pings, 1);
    assert_eq!(peer.state(), PeerState::Ready);
    peer.stop().await;
}

/// A remote that answers pings keeps the session alive past the idle timeout.
#[tokio::test]
async fn test_traffic_resets_idle_timeout() {
    let mut config = peer_config();
    config.read_timeout = Duration::from_millis(50);
    config.idle_timeout = Duration::from_millis(400);
    config.ping_interval = Duration::from_millis(150);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let peer = Peer::outgoing(addr, Arc::new(config), tx);
    peer.start();

    let (stream, _) = listener.accept().await.unwrap();
    let (mut reader, mut writer) = remote(stream);
    assert!(matches!(reader.next().await, Some(Ok(Message::Version(_)))));
    writer.send(Message::Version(remote_version(9))).await.unwrap();
    assert!(matches!(rx.recv().await, Some(PeerEvent::Connected(_))));

    let until = tokio::time::Instant::now() + Duration::from_millis(1000);
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(until, reader.next()).await {
        if let Message::Ping(nonce) = message {
            writer.send(Message::Pong(nonce)).await.unwrap();
        }
    }

    assert_eq!(peer.state(), PeerState::Connected);
    peer.stop().await;
    assert!(matches!(rx.recv().await, Some(PeerEvent::Stopped(_))));
}
