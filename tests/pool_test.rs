//! Connection pool integration tests
//!
//! Exercises saturation, waiter hand-off, and shutdown against a live
//! local TCP listener.

use std::time::{Duration, Instant};

use tokio::net::TcpListener;

use mcpgate::error::as_mcpgate_error;
use mcpgate::pool::{ConnectionPool, PoolConfig};

async fn spawn_backend() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((socket, _)) => held.push(socket),
                Err(_) => break,
            }
        }
    });
    (addr, handle)
}

#[tokio::test]
async fn test_exhaustion_and_release_hands_socket_to_waiter() {
    let (addr, _server) = spawn_backend().await;
    let mut config = PoolConfig::new(addr.ip().to_string(), addr.port());
    config.min_connections = 0;
    config.max_connections = 2;
    config.connect_timeout = Duration::from_millis(100);
    config.health_check_interval = Duration::ZERO;
    let pool = ConnectionPool::new(config);

    // Two borrows saturate the pool quickly.
    let started = Instant::now();
    let first = pool.get(Duration::from_millis(500)).await.unwrap();
    let second = pool.get(Duration::from_millis(500)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    // The third blocks until a holder releases.
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let conn = waiter_pool.get(Duration::from_millis(500)).await;
        (conn, started.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.release(first, true);

    let (conn, waited) = waiter.await.unwrap();
    let conn = conn.expect("waiter should receive the released connection");
    assert!(
        waited >= Duration::from_millis(190) && waited < Duration::from_millis(350),
        "waiter resumed after {waited:?}"
    );
    // The released socket was reused, not a third connection.
    assert_eq!(pool.stats().created, 2);
    assert_eq!(conn.use_count(), 2, "MRU reuse of the released socket");

    pool.release(conn, true);
    pool.release(second, true);
    pool.destroy().await;
}

#[tokio::test]
async fn test_release_pairs_keep_counts_consistent() {
    let (addr, _server) = spawn_backend().await;
    let mut config = PoolConfig::new(addr.ip().to_string(), addr.port());
    config.max_connections = 4;
    config.health_check_interval = Duration::ZERO;
    let pool = ConnectionPool::new(config);

    for _ in 0..5 {
        let a = pool.get(Duration::from_secs(1)).await.unwrap();
        let b = pool.get(Duration::from_secs(1)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, stats.idle + stats.active);
        pool.release(a, true);
        pool.release(b, false);
        let stats = pool.stats();
        assert_eq!(stats.total, stats.idle + stats.active);
    }

    let stats = pool.stats();
    assert_eq!(stats.gets, 10);
    assert_eq!(stats.created, stats.closed + stats.total as u64);
    pool.destroy().await;
}

#[tokio::test]
async fn test_destroyed_pool_fails_fast() {
    let (addr, _server) = spawn_backend().await;
    let mut config = PoolConfig::new(addr.ip().to_string(), addr.port());
    config.health_check_interval = Duration::ZERO;
    let pool = ConnectionPool::new(config);

    let conn = pool.get(Duration::from_secs(1)).await.unwrap();
    pool.release(conn, true);
    pool.destroy().await;

    let started = Instant::now();
    let err = pool.get(Duration::from_secs(5)).await.unwrap_err();
    assert!(as_mcpgate_error(&err).unwrap().is_shutdown());
    assert!(started.elapsed() < Duration::from_millis(50), "no wait after destroy");

    let stats = pool.stats();
    assert_eq!(stats.total, 0, "idle connections drained on destroy");
}
