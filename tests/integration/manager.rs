//! Connection manager admission and end-to-end crawling over loopback.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::*;

/// With room for two peers, a third inbound connection is closed while the
/// first two stay admitted.
#[tokio::test]
async fn test_inbound_admission_respects_ceiling() {
    let repo = repository_on(0);
    let manager = loopback_manager(0, 0, 2, repo.clone());
    manager.start().unwrap();
    let addr = manager.listen_addrs()[0];

    let first = TcpStream::connect(addr).await.unwrap();
    wait_until(5, || async { manager.peer_count() == 1 }).await.unwrap();
    let second = TcpStream::connect(addr).await.unwrap();
    wait_until(5, || async { manager.peer_count() == 2 }).await.unwrap();

    let mut third = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), third.read(&mut buf))
        .await
        .expect("rejected connection should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert_eq!(manager.peer_count(), 2);
    let counters = manager.counters();
    assert_eq!(counters.total, 2);
    assert_eq!(counters.pending, 2);
    assert!(manager.peer(&first.local_addr().unwrap()).is_some());
    assert!(manager.peer(&second.local_addr().unwrap()).is_some());

    manager.stop().await;
    assert_eq!(manager.peer_count(), 0);
    repo.shutdown().await;
}

/// Outbound dials and a burst of inbound connections race for the last
/// slot; the index never holds more than the ceiling.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_respects_ceiling() {
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    let held = tokio::spawn(async move {
        let mut accepted = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            accepted.push(stream);
        }
    });

    let repo = repository_on(silent_port);
    for last in 1..=8u8 {
        repo.discovered(std::net::SocketAddr::from(([127, 0, 0, last], silent_port)))
            .await;
    }
    let manager = loopback_manager(0, 1000, 2, repo.clone());
    manager.start().unwrap();
    let addr = manager.listen_addrs()[0];

    let dialers: Vec<_> = (0..16)
        .map(|_| tokio::spawn(async move { TcpStream::connect(addr).await.ok() }))
        .collect();

    let mut peak = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    while tokio::time::Instant::now() < deadline {
        peak = peak.max(manager.peer_count());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(peak <= 2, "peer index reached {peak} with max_connected=2");
    assert!(manager.peer_count() >= 1);

    let mut streams = Vec::new();
    for dialer in dialers {
        streams.extend(dialer.await.unwrap());
    }
    manager.stop().await;
    assert_eq!(manager.peer_count(), 0);
    held.abort();
    repo.shutdown().await;
}

/// One manager dials another found in its address book; both sides reach
/// Ready and the address is recorded as a success.
#[tokio::test]
async fn test_managers_crawl_each_other() {
    let server_repo = repository_on(0);
    let server = loopback_manager(0, 0, 8, server_repo.clone());
    server.start().unwrap();
    let server_addr = server.listen_addrs()[0];

    let client_repo = repository_on(server_addr.port());
    client_repo.discovered(server_addr).await;
    let client = loopback_manager(0, 20, 8, client_repo.clone());
    client.start().unwrap();

    wait_until(5, || async {
        client_repo
            .lookup(server_addr)
            .await
            .map_or(false, |node| node.last_succeeded.is_some())
    })
    .await
    .unwrap();

    let node = client_repo.lookup(server_addr).await.unwrap();
    assert_eq!(node.num_attempts, 0);
    assert!(node.last_connected.is_some());
    assert_eq!(client.counters().ready, 1);
    wait_until(5, || async { server.counters().ready == 1 }).await.unwrap();

    client.stop().await;
    wait_until(5, || async { server.peer_count() == 0 }).await.unwrap();
    server.stop().await;
    client_repo.shutdown().await;
    server_repo.shutdown().await;
}

/// A manager whose address book holds its own listener dials itself; the
/// nonce check tears both ends down and nothing is marked connected.
#[tokio::test]
async fn test_manager_rejects_dialing_itself() {
    let port = free_port();
    let own: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let repo = repository_on(port);
    repo.discovered(own).await;
    let manager = loopback_manager(port, 20, 8, repo.clone());
    manager.start().unwrap();
    assert_eq!(manager.listen_addrs(), vec![own]);

    wait_until(5, || async {
        repo.lookup(own).await.map_or(false, |node| node.num_attempts == 1)
    })
    .await
    .unwrap();
    wait_until(5, || async { manager.peer_count() == 0 }).await.unwrap();

    let node = repo.lookup(own).await.unwrap();
    assert_eq!(node.num_attempts, 1);
    assert!(node.last_connected.is_none());
    assert!(node.last_succeeded.is_none());
    assert_eq!(repo.retrieve().await, None);

    manager.stop().await;
    repo.shutdown().await;
}

/// Stopping with sessions mid-handshake closes every connection.
#[tokio::test]
async fn test_stop_closes_pending_sessions() {
    let repo = repository_on(0);
    let manager = loopback_manager(0, 0, 8, repo.clone());
    manager.start().unwrap();
    let addr = manager.listen_addrs()[0];

    let mut streams = Vec::new();
    for i in 1..=3 {
        streams.push(TcpStream::connect(addr).await.unwrap());
        wait_until(5, || async { manager.peer_count() == i }).await.unwrap();
    }

    manager.stop().await;
    manager.stop().await;
    assert_eq!(manager.peer_count(), 0);

    for stream in &mut streams {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("stream should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
    repo.shutdown().await;
}
