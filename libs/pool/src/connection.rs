//! Pooled backend connections.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::probe;

/// A slot in a pool's live count, released when dropped.
#[derive(Debug)]
pub(crate) struct Lease {
    pub(crate) pool_id: u64,
    live: Arc<AtomicUsize>,
}

impl Lease {
    /// Take a slot if fewer than `max` are live. `max == 0` means unbounded.
    pub(crate) fn acquire(pool_id: u64, live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (max == 0 || n < max).then_some(n + 1)
        })
        .ok()?;

        Some(Self {
            pool_id,
            live: Arc::clone(live),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One backend socket owned by a pool.
///
/// While idle it sits in the pool. While in use it is owned by exactly one
/// relay. Dropping it closes the socket and frees its slot in the pool.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    topology: String,
    stream: TcpStream,
    pub(crate) created_at: Instant,
    pub(crate) returned_at: Instant,
    readonly: bool,
    cancel: CancellationToken,
    pub(crate) lease: Lease,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        topology: String,
        stream: TcpStream,
        now: Instant,
        lease: Lease,
    ) -> Self {
        Self {
            id,
            topology,
            stream,
            created_at: now,
            returned_at: now,
            readonly: false,
            cancel: CancellationToken::new(),
            lease,
        }
    }

    /// Pool-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Topology the backend address resolved to at dial time.
    pub fn topology(&self) -> &str {
        &self.topology
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Make every pending and future read fail with [`io::ErrorKind::TimedOut`].
    ///
    /// The socket stays open and writes are unaffected. The pool clears the
    /// cancellation before handing the connection out again.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that cancels reads from another task.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The backend refused a write because it is a replica.
    pub fn mark_readonly(&mut self) {
        self.readonly = true;
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Split into a cancellable read half and a write half.
    pub fn split(&mut self) -> (CancellableRead<'_>, WriteHalf<'_>) {
        let cancelled = Box::pin(self.cancel.clone().cancelled_owned());
        let (read, write) = self.stream.split();
        (
            CancellableRead {
                inner: read,
                cancelled,
            },
            write,
        )
    }

    /// Clear any cancellation, then probe the socket.
    pub(crate) fn is_healthy(&mut self) -> bool {
        self.cancel = CancellationToken::new();
        probe::is_alive(&self.stream)
    }
}

/// Read half of a [`Connection`] that honours [`Connection::cancel`].
pub struct CancellableRead<'a> {
    inner: ReadHalf<'a>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl AsyncRead for CancellableRead<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "read cancelled",
            )));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let live = Arc::new(AtomicUsize::new(0));
        let lease = Lease::acquire(1, &live, 0).unwrap();
        let conn = Connection::new(1, String::new(), client.unwrap(), Instant::now(), lease);
        (conn, server.unwrap().0)
    }

    #[test]
    fn test_lease_respects_bound() {
        let live = Arc::new(AtomicUsize::new(0));
        let a = Lease::acquire(1, &live, 2).unwrap();
        let _b = Lease::acquire(1, &live, 2).unwrap();
        assert!(Lease::acquire(1, &live, 2).is_none());

        drop(a);
        assert_eq!(live.load(Ordering::Acquire), 1);
        assert!(Lease::acquire(1, &live, 2).is_some());
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_read() {
        let (mut conn, _server) = connected_pair().await;
        let canceller = conn.canceller();

        let (mut read, _write) = conn.split();
        let mut buf = [0u8; 8];
        let pending = read.read(&mut buf);

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = pending.await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_leaves_writes_working() {
        let (mut conn, mut server) = connected_pair().await;
        conn.cancel();

        let (mut read, mut write) = conn.split();
        let mut buf = [0u8; 4];
        assert_eq!(
            read.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );

        write.write_all(b"ping").await.unwrap();
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_probe() {
        let (mut conn, mut server) = connected_pair().await;
        assert!(conn.is_healthy());

        // Unsolicited bytes on an idle connection mean it is out of sync.
        server.write_all(b"+OK\r\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!conn.is_healthy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_probe_detects_closed_peer() {
        let (mut conn, server) = connected_pair().await;
        drop(server);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!conn.is_healthy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_probe_clears_cancellation() {
        let (mut conn, mut server) = connected_pair().await;
        conn.cancel();
        assert!(conn.is_healthy());

        server.write_all(b"x").await.unwrap();
        let (mut read, _write) = conn.split();
        let mut buf = [0u8; 1];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }
}
