//! Integration tests for the connection pool against live mock backends.

use std::sync::Arc;
use std::time::Duration;

use tether_networking::TopologyRouter;
use tether_pool::{ConnectionPool, PoolError, PoolOptions, RoundRobinDialer, TcpDialer};
use tether_testing::MockBackend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn dialer(backend: &MockBackend) -> Arc<TcpDialer> {
    Arc::new(TcpDialer::new(
        backend.addr.to_string(),
        Duration::from_secs(1),
    ))
}

fn options(max_connections: usize, min_idle: usize, max_idle: usize) -> PoolOptions {
    PoolOptions {
        max_connections,
        min_idle_connections: min_idle,
        max_idle_connections: max_idle,
        ..Default::default()
    }
}

/// Poll until `check` holds, failing the test after one second.
async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn get_dials_and_counts_connection() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 0, 2));

    let conn = pool.get("").await.unwrap();
    assert_eq!(pool.connections(), 1);
    assert_eq!(pool.idle_connections(), 0);
    assert_eq!(conn.peer_addr().unwrap(), backend.addr);
}

#[tokio::test]
async fn put_then_get_reuses_socket() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 0, 2));

    let conn = pool.get("").await.unwrap();
    let local = conn.local_addr().unwrap();
    pool.put(conn);
    assert_eq!(pool.idle_connections(), 1);

    let conn = pool.get("").await.unwrap();
    assert_eq!(conn.local_addr().unwrap(), local);
    assert_eq!(pool.connections(), 1);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn zero_max_idle_closes_on_put() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 0, 0));

    let conn = pool.get("").await.unwrap();
    pool.put(conn);

    assert_eq!(pool.idle_connections(), 0);
    assert_eq!(pool.connections(), 0);
}

#[tokio::test]
async fn idle_set_never_exceeds_max_idle() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 0, 2));

    let a = pool.get("").await.unwrap();
    let b = pool.get("").await.unwrap();
    let c = pool.get("").await.unwrap();
    assert_eq!(pool.connections(), 3);

    pool.put(a);
    pool.put(b);
    pool.put(c);

    assert_eq!(pool.idle_connections(), 2);
    assert_eq!(pool.connections(), 2);
}

#[tokio::test]
async fn max_connections_yields_exhausted() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 0, 2));

    let _a = pool.get("").await.unwrap();
    let _b = pool.get("").await.unwrap();
    let c = pool.get("").await.unwrap();

    let err = pool.get("").await.unwrap_err();
    assert!(matches!(err, PoolError::Exhausted));

    // Returning one frees the slot for reuse.
    pool.put(c);
    pool.get("").await.unwrap();
}

#[tokio::test]
async fn max_idle_time_expires_idle_connection() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(
        dialer(&backend),
        PoolOptions {
            max_idle_time: Duration::from_millis(10),
            ..options(3, 0, 2)
        },
    );

    let conn = pool.get("").await.unwrap();
    let local = conn.local_addr().unwrap();
    pool.put(conn);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let conn = pool.get("").await.unwrap();
    assert_ne!(conn.local_addr().unwrap(), local);
    assert_eq!(pool.idle_connections(), 0);
}

#[tokio::test]
async fn max_lifetime_expires_reused_connection() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(
        dialer(&backend),
        PoolOptions {
            max_lifetime: Duration::from_millis(10),
            ..options(3, 0, 2)
        },
    );

    let conn = pool.get("").await.unwrap();
    let local = conn.local_addr().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.put(conn);

    let conn = pool.get("").await.unwrap();
    assert_ne!(conn.local_addr().unwrap(), local);
    assert_eq!(pool.connections(), 1);
}

#[tokio::test]
async fn connection_with_unread_data_is_discarded() {
    let backend = MockBackend::echo().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 0, 2));

    let mut conn = pool.get("").await.unwrap();
    let local = conn.local_addr().unwrap();
    {
        // Leave an unread reply behind so the idle socket is out of sync.
        let (_read, mut write) = conn.split();
        write.write_all(b"stale").await.unwrap();
    }
    pool.put(conn);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let conn = pool.get("").await.unwrap();
    assert_ne!(conn.local_addr().unwrap(), local);
}

#[tokio::test]
async fn min_idle_connections_are_replenished() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(3, 2, 2));

    eventually(|| pool.idle_connections() == 2, "initial idle connections").await;

    let _first = pool.get("").await.unwrap();
    eventually(|| pool.idle_connections() == 2, "refill after first get").await;

    let _second = pool.get("").await.unwrap();
    // Only one more slot under max_connections.
    eventually(|| pool.idle_connections() == 1, "refill after second get").await;
    assert_eq!(pool.connections(), 3);
}

#[tokio::test]
async fn closing_readonly_connection_triggers_refill() {
    let backend = MockBackend::silent().await.unwrap();
    let pool = ConnectionPool::new(dialer(&backend), options(1, 1, 1));

    eventually(|| pool.idle_connections() == 1, "initial idle connection").await;

    let mut conn = pool.get("").await.unwrap();
    // Let the refill started by get fail against max_connections first.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.idle_connections(), 0);

    conn.mark_readonly();
    pool.put(conn);

    eventually(|| pool.idle_connections() == 1, "refill after readonly close").await;
    eventually(|| backend.connection_count() == 2, "second dial accepted").await;
}

#[tokio::test]
async fn unmatched_hint_falls_back_to_known_topology() {
    let backend = MockBackend::silent().await.unwrap();
    let topologies = TopologyRouter::parse(&format!("default={}/32", backend.addr.ip())).unwrap();
    let pool = ConnectionPool::new(
        dialer(&backend),
        PoolOptions {
            topologies,
            ..options(3, 2, 2)
        },
    );

    eventually(|| pool.idle_connections() == 2, "initial idle connections").await;

    let conn = pool.get("dummy").await.unwrap();
    assert_eq!(conn.topology(), "default");
    assert_eq!(pool.idle_connections(), 1);

    pool.put(conn);
    assert_eq!(pool.idle_connections(), 2);
}

#[tokio::test]
async fn backend_outside_every_topology_lands_in_default_bucket() {
    let backend = MockBackend::silent().await.unwrap();
    let topologies = TopologyRouter::parse("unknown=1.1.1.1/32").unwrap();
    let pool = ConnectionPool::new(
        dialer(&backend),
        PoolOptions {
            topologies,
            ..options(3, 2, 2)
        },
    );

    eventually(|| pool.idle_connections() == 2, "initial idle connections").await;

    let conn = pool.get("dummy").await.unwrap();
    assert_eq!(conn.topology(), "");
    assert_eq!(pool.idle_connections(), 1);

    pool.put(conn);
    assert_eq!(pool.idle_connections(), 2);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn hinted_topology_is_preferred() {
    let near = MockBackend::spawn("127.0.0.1:0", tether_testing::Behavior::Echo)
        .await
        .unwrap();
    let far = MockBackend::spawn("127.0.0.2:0", tether_testing::Behavior::Echo)
        .await
        .unwrap();

    let topologies = TopologyRouter::parse("default=127.0.0.1/32").unwrap();
    // Dials alternate, far first.
    let dialer = Arc::new(RoundRobinDialer::new(
        vec![far.addr, near.addr],
        Duration::from_secs(1),
    ));
    let pool = ConnectionPool::new(
        dialer,
        PoolOptions {
            topologies,
            ..options(3, 2, 2)
        },
    );

    eventually(|| pool.idle_connections() == 2, "initial idle connections").await;

    let mut conn = pool.get("default").await.unwrap();
    assert_eq!(conn.peer_addr().unwrap(), near.addr);
    assert_eq!(pool.idle_connections(), 1);

    {
        let (mut read, mut write) = conn.split();
        write.write_all(b"1").await.unwrap();
        let mut buf = [0u8; 1];
        read.read_exact(&mut buf).await.unwrap();
    }

    pool.put(conn);
    eventually(|| pool.idle_connections() == 2, "idle after put").await;
    assert_eq!(near.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_and_put_keep_bounds() {
    let backend = MockBackend::silent().await.unwrap();
    let topologies = TopologyRouter::parse(&format!("default={}/32", backend.addr.ip())).unwrap();
    let pool = ConnectionPool::new(
        dialer(&backend),
        PoolOptions {
            topologies,
            ..options(100, 2, 5)
        },
    );

    eventually(|| pool.idle_connections() == 2, "initial idle connections").await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..100 {
        let pool = pool.clone();
        tasks.spawn(async move {
            let mut conn = pool.get("default").await.unwrap();
            {
                let (_read, mut write) = conn.split();
                write.write_all(b"1").await.unwrap();
            }
            pool.put(conn);
            assert!(pool.idle_connections() <= 5);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    assert!(pool.idle_connections() <= 5);
    eventually(
        || pool.connections() == pool.idle_connections(),
        "all connections idle",
    )
    .await;
}
