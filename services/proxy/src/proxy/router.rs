//! Upstream selection.
//!
//! Every relay holds a writer (primary) connection. With reader routing on it
//! also holds a reader (replica) connection, and each client command goes to
//! one of the two depending on its classification.

use std::sync::Arc;
use std::time::Duration;

use tether_networking::TopologyRouter;
use tether_pool::{ConnectionPool, PoolOptions, TcpDialer};
use tether_resp::CommandKind;

/// Which backend a command is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Writer,
    Reader,
}

/// Reads may go to a replica, everything else goes to the primary.
pub fn route(kind: CommandKind) -> Route {
    match kind {
        CommandKind::Read => Route::Reader,
        CommandKind::Write => Route::Writer,
    }
}

/// A backend address and the pool of connections to it.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub addr: String,
    pub pool: ConnectionPool,
}

impl Upstream {
    pub fn connect(addr: &str, connect_timeout: Duration, options: PoolOptions) -> Self {
        let dialer = Arc::new(TcpDialer::new(addr, connect_timeout));
        Self {
            addr: addr.to_string(),
            pool: ConnectionPool::new(dialer, options),
        }
    }
}

/// The upstreams a relay draws from, plus the topology it prefers.
#[derive(Debug, Clone)]
pub struct Upstreams {
    writer: Upstream,
    reader: Option<Upstream>,
    self_topology: String,
}

impl Upstreams {
    /// `reader` enables read/write splitting.
    pub fn new(writer: Upstream, reader: Option<Upstream>) -> Self {
        Self {
            writer,
            reader,
            self_topology: String::new(),
        }
    }

    /// Prefer idle connections in the topology `own_ip` belongs to.
    pub fn with_self_topology(mut self, topologies: &TopologyRouter, own_ip: Option<std::net::IpAddr>) -> Self {
        self.self_topology = topologies.self_topology(own_ip).to_string();
        self
    }

    pub fn writer(&self) -> &Upstream {
        &self.writer
    }

    pub fn reader(&self) -> Option<&Upstream> {
        self.reader.as_ref()
    }

    pub fn is_splitting(&self) -> bool {
        self.reader.is_some()
    }

    pub fn self_topology(&self) -> &str {
        &self.self_topology
    }

    /// Every upstream, writer first.
    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        std::iter::once(&self.writer).chain(self.reader.as_ref())
    }
}
