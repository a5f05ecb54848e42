//! Topology-aware pool of backend connections.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_networking::{TopologyRouter, DEFAULT_TOPOLOGY};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::connection::{Connection, Lease};
use crate::dialer::Dialer;
use crate::error::PoolError;
use crate::jitter::{no_jitter, Jitter};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Order in which idle connections are handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Oldest returned first. Spreads use across the idle set.
    #[default]
    Fifo,
    /// Most recently returned first. Lets surplus connections age out.
    Lifo,
}

/// Pool tuning.
#[derive(Clone)]
pub struct PoolOptions {
    /// Upper bound on live connections. Zero means unbounded.
    pub max_connections: usize,
    /// Upper bound on idle connections. Zero disables idle pooling.
    pub max_idle_connections: usize,
    /// Idle connections kept warm in the background.
    pub min_idle_connections: usize,
    /// Idle connections older than this are discarded. Zero disables.
    pub max_idle_time: Duration,
    /// Connections older than this are discarded. Zero disables.
    pub max_lifetime: Duration,
    pub jitter: Jitter,
    pub strategy: Strategy,
    /// Affinity groups. Empty disables topology-awareness.
    pub topologies: TopologyRouter,
    pub clock: Arc<dyn Clock>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_idle_connections: 0,
            min_idle_connections: 0,
            max_idle_time: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            jitter: no_jitter(),
            strategy: Strategy::default(),
            topologies: TopologyRouter::disabled(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("max_connections", &self.max_connections)
            .field("max_idle_connections", &self.max_idle_connections)
            .field("min_idle_connections", &self.min_idle_connections)
            .field("max_idle_time", &self.max_idle_time)
            .field("max_lifetime", &self.max_lifetime)
            .field("strategy", &self.strategy)
            .field("topologies", &self.topologies)
            .finish_non_exhaustive()
    }
}

/// A pool of connections to one backend.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    dialer: Arc<dyn Dialer>,
    options: PoolOptions,
    /// Idle buckets keyed by topology name.
    idle: Mutex<BTreeMap<String, VecDeque<Connection>>>,
    idle_count: AtomicUsize,
    live: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
    replenishing: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool and, when called inside a runtime, start warming idle
    /// connections up to `min_idle_connections`.
    pub fn new(dialer: Arc<dyn Dialer>, options: PoolOptions) -> Self {
        let pool = Self {
            inner: Arc::new(Inner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                dialer,
                options,
                idle: Mutex::new(BTreeMap::new()),
                idle_count: AtomicUsize::new(0),
                live: Arc::new(AtomicUsize::new(0)),
                next_connection_id: AtomicU64::new(1),
                replenishing: AtomicBool::new(false),
            }),
        };
        pool.replenish();
        pool
    }

    /// Check out a connection, preferring the idle bucket of `topology_hint`.
    ///
    /// Falls back to any other topology's idle connections before dialing.
    /// Dropping the returned future while it dials abandons the dial and
    /// releases its slot.
    pub async fn get(&self, topology_hint: &str) -> Result<Connection, PoolError> {
        let result = match self.inner.take_idle(topology_hint) {
            Some(conn) => Ok(conn),
            None => self.inner.dial().await,
        };
        self.replenish();
        result
    }

    /// Return a connection for reuse.
    ///
    /// The connection is closed instead when the idle set is full, when it
    /// was marked readonly, or when it belongs to another pool.
    pub fn put(&self, conn: Connection) {
        self.inner.release(conn);
        self.replenish();
    }

    /// Idle connections, read without taking the pool lock.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle_count.load(Ordering::Acquire)
    }

    /// Live connections, idle and checked out.
    pub fn connections(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Start a background top-up toward `min_idle_connections` unless one is
    /// already running.
    fn replenish(&self) {
        let target = self.inner.replenish_target();
        if target == 0 || self.idle_connections() >= target {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            return;
        };
        if self.inner.replenishing.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            inner.fill_idle(target).await;
            inner.replenishing.store(false, Ordering::Release);
        });
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("connections", &self.connections())
            .field("idle_connections", &self.idle_connections())
            .finish()
    }
}

impl Inner {
    fn topology_aware(&self) -> bool {
        self.options.topologies.is_enabled()
    }

    fn replenish_target(&self) -> usize {
        self.options
            .min_idle_connections
            .min(self.options.max_idle_connections)
    }

    /// Park `conn` in its topology bucket, or close it.
    fn release(&self, mut conn: Connection) {
        if conn.lease.pool_id != self.id {
            warn!(
                connection_id = conn.id(),
                "connection returned to a pool that does not own it"
            );
            return;
        }

        if conn.is_readonly() {
            debug!(connection_id = conn.id(), "discarding readonly connection");
            return;
        }

        let mut idle = self.idle.lock();
        if self.idle_count.load(Ordering::Acquire) >= self.options.max_idle_connections {
            drop(idle);
            debug!(connection_id = conn.id(), "idle pool full, closing connection");
            return;
        }

        conn.returned_at = self.options.clock.now();
        idle.entry(conn.topology().to_string())
            .or_default()
            .push_back(conn);
        self.idle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Pop the first valid idle connection, hinted bucket first.
    fn take_idle(&self, topology_hint: &str) -> Option<Connection> {
        let key = if self.topology_aware() {
            topology_hint
        } else {
            DEFAULT_TOPOLOGY
        };

        let mut idle = self.idle.lock();
        if let Some(conn) = self.pop_valid(&mut idle, key) {
            return Some(conn);
        }
        if !self.topology_aware() {
            return None;
        }

        let others: Vec<String> = idle
            .iter()
            .filter(|(name, bucket)| name.as_str() != key && !bucket.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        for name in others {
            if let Some(conn) = self.pop_valid(&mut idle, &name) {
                debug!(
                    wanted = topology_hint,
                    got = %name,
                    "falling back to another topology"
                );
                return Some(conn);
            }
        }
        None
    }

    /// Pop from one bucket until a candidate survives validation. Rejected
    /// candidates are dropped, which closes them and frees their slot.
    fn pop_valid(
        &self,
        idle: &mut BTreeMap<String, VecDeque<Connection>>,
        key: &str,
    ) -> Option<Connection> {
        let bucket = idle.get_mut(key)?;

        loop {
            let mut conn = match self.options.strategy {
                Strategy::Fifo => bucket.pop_front(),
                Strategy::Lifo => bucket.pop_back(),
            }?;
            self.idle_count.fetch_sub(1, Ordering::AcqRel);

            if let Some(reason) = self.expired(&conn, self.options.clock.now()) {
                debug!(connection_id = conn.id(), reason, "discarding idle connection");
                continue;
            }
            if !conn.is_healthy() {
                debug!(connection_id = conn.id(), "discarding unhealthy idle connection");
                continue;
            }

            return Some(conn);
        }
    }

    fn expired(&self, conn: &Connection, now: Instant) -> Option<&'static str> {
        let jitter = &self.options.jitter;

        let max_lifetime = self.options.max_lifetime;
        if !max_lifetime.is_zero()
            && now.saturating_duration_since(conn.created_at) > jitter(max_lifetime)
        {
            return Some("max lifetime exceeded");
        }

        let max_idle_time = self.options.max_idle_time;
        if !max_idle_time.is_zero()
            && now.saturating_duration_since(conn.returned_at) > jitter(max_idle_time)
        {
            return Some("max idle time exceeded");
        }

        None
    }

    /// Dial a new connection, holding a live slot for the duration.
    async fn dial(&self) -> Result<Connection, PoolError> {
        let lease = Lease::acquire(self.id, &self.live, self.options.max_connections)
            .ok_or(PoolError::Exhausted)?;

        let stream = self.dialer.dial().await.map_err(PoolError::Dial)?;

        let topology = match stream.peer_addr() {
            Ok(addr) => self.options.topologies.resolve(addr).to_string(),
            Err(_) => DEFAULT_TOPOLOGY.to_string(),
        };
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        Ok(Connection::new(
            id,
            topology,
            stream,
            self.options.clock.now(),
            lease,
        ))
    }

    /// Dial straight into the idle set until it holds `target` connections.
    async fn fill_idle(&self, target: usize) {
        while self.idle_count.load(Ordering::Acquire) < target {
            let mut conn = match self.dial().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "failed to prepare idle connection");
                    return;
                }
            };

            let mut idle = self.idle.lock();
            if self.idle_count.load(Ordering::Acquire) >= self.options.max_idle_connections {
                return;
            }
            conn.returned_at = self.options.clock.now();
            idle.entry(conn.topology().to_string())
                .or_default()
                .push_back(conn);
            self.idle_count.fetch_add(1, Ordering::AcqRel);
        }
    }
}
