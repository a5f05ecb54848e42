//! Backend connection establishment.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

/// Opens new backend sockets for a pool.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<TcpStream>;
}

/// Dials one fixed address with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    /// `addr` may be a `host:port` pair and is resolved on every dial.
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<TcpStream> {
        connect(self.addr.as_str(), &self.addr, self.connect_timeout).await
    }
}

/// Round-robins across a fixed list of addresses.
///
/// Useful when one logical backend is reachable through several addresses,
/// for example one per topology.
#[derive(Debug)]
pub struct RoundRobinDialer {
    addrs: Vec<SocketAddr>,
    next: std::sync::atomic::AtomicUsize,
    connect_timeout: Duration,
}

impl RoundRobinDialer {
    pub fn new(addrs: Vec<SocketAddr>, connect_timeout: Duration) -> Self {
        Self {
            addrs,
            next: std::sync::atomic::AtomicUsize::new(0),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for RoundRobinDialer {
    async fn dial(&self) -> io::Result<TcpStream> {
        if self.addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no backend addresses configured",
            ));
        }

        let i = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.addrs.len();
        let addr = self.addrs[i];

        connect(addr, &addr, self.connect_timeout).await
    }
}

/// Connect with a timeout and apply the socket options every backend
/// connection gets.
async fn connect(
    addr: impl ToSocketAddrs,
    label: &(dyn fmt::Display + Sync),
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {label} timed out"),
            ))
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr = %label, error = %e, "failed to set TCP_NODELAY");
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_tcp_dialer_sets_nodelay() {
        let (_listener, addr) = listener().await;
        let stream = TcpDialer::new(addr.to_string(), Duration::from_secs(1))
            .dial()
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_round_robin_dialer_rotates_and_sets_nodelay() {
        let (_a, a) = listener().await;
        let (_b, b) = listener().await;
        let dialer = RoundRobinDialer::new(vec![a, b], Duration::from_secs(1));

        let first = dialer.dial().await.unwrap();
        let second = dialer.dial().await.unwrap();
        let third = dialer.dial().await.unwrap();

        assert_eq!(first.peer_addr().unwrap(), a);
        assert_eq!(second.peer_addr().unwrap(), b);
        assert_eq!(third.peer_addr().unwrap(), a);
        assert!(first.nodelay().unwrap());
        assert!(second.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_round_robin_dialer_without_addresses() {
        let dialer = RoundRobinDialer::new(Vec::new(), Duration::from_secs(1));
        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
