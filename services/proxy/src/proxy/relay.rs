//! Byte relays between one client and its backend connections.
//!
//! A relay runs every copy direction as a future in the relay's own task and
//! ends as soon as any direction finishes. On shutdown the backend reads are
//! cancelled and the backend-to-client directions get up to
//! [`DRAIN_TIMEOUT`] to flush what was already read, so the client rarely
//! sees a reply cut in half. A client that stopped reading cannot hold the
//! relay open past that bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tether_pool::Connection;
use tether_resp::{classify, command_name, Parser};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::router::{route, Route};
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::shutdown::wait_for_shutdown;

const BUFFER_SIZE: usize = 8 * 1024;

/// Longest a stopping relay waits for backend replies to reach the client.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Error reply prefix a replica or demoted primary sends for writes.
const READONLY_PREFIX: &str = "READONLY";

/// Commands not counted in `redis_commands_total`. Clients send COMMAND on
/// every connect.
const UNCOUNTED_COMMAND: &str = "COMMAND";

/// A participant in a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Writer,
    Reader,
    /// The relay was told to stop.
    Shutdown,
}

/// How a relay ended.
#[derive(Debug)]
pub struct Outcome {
    /// The side that closed or failed first.
    pub ended_by: Side,
    pub error: Option<RelayError>,
    /// The writer answered with a READONLY error at least once.
    pub writer_readonly: bool,
    /// The shutdown drain was cut off, so backends may hold unread replies.
    pub abandoned: bool,
}

impl Outcome {
    fn closed(side: Side) -> Self {
        Self {
            ended_by: side,
            error: None,
            writer_readonly: false,
            abandoned: false,
        }
    }

    fn failed(side: Side, error: impl Into<RelayError>) -> Self {
        Self {
            ended_by: side,
            error: Some(error.into()),
            writer_readonly: false,
            abandoned: false,
        }
    }

    /// A backend that closed or failed, or whose replies were abandoned,
    /// cannot be reused.
    pub fn reusable(&self, backend: Side) -> bool {
        self.ended_by != backend && !self.abandoned
    }
}

/// Copy bytes both ways between `client` and `backend` without parsing.
pub async fn plain(
    client: &mut TcpStream,
    backend: &mut Connection,
    shutdown: &mut watch::Receiver<bool>,
) -> Outcome {
    let cancel = backend.canceller();
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let upstream = copy(&mut client_read, &mut backend_write, Side::Client, Side::Writer);
    let downstream = copy(&mut backend_read, &mut client_write, Side::Writer, Side::Client);
    tokio::pin!(upstream, downstream);

    let mut outcome = tokio::select! {
        outcome = &mut upstream => outcome,
        outcome = &mut downstream => outcome,
        _ = wait_for_shutdown(shutdown) => Outcome::closed(Side::Shutdown),
    };

    if outcome.ended_by == Side::Shutdown {
        cancel.cancel();
        match tokio::time::timeout(DRAIN_TIMEOUT, downstream).await {
            Ok(drained) => debug!(ended_by = ?drained.ended_by, "drained backend replies"),
            Err(_) => {
                debug!("client not reading, abandoning backend replies");
                outcome.abandoned = true;
            }
        }
    }

    outcome
}

/// Parse client commands and send reads to `reader`, everything else to
/// `writer`.
///
/// Replies are written back as each backend produces them. Commands are
/// forwarded one whole message at a time, but replies from the two backends
/// are not reordered against each other.
pub async fn split(
    client: &mut TcpStream,
    writer: &mut Connection,
    reader: &mut Connection,
    metrics: &Metrics,
    shutdown: &mut watch::Receiver<bool>,
) -> Outcome {
    let writer_cancel = writer.canceller();
    let reader_cancel = reader.canceller();
    let readonly = AtomicBool::new(false);

    let (client_read, client_write) = client.split();
    let client_write = Mutex::new(client_write);
    let (writer_read, mut writer_write) = writer.split();
    let (mut reader_read, mut reader_write) = reader.split();

    let requests = forward_commands(client_read, &mut writer_write, &mut reader_write, metrics);
    let replies = forward_replies(writer_read, &client_write, &readonly);
    let replica = copy_shared(&mut reader_read, &client_write);
    tokio::pin!(requests, replies, replica);

    let mut outcome = tokio::select! {
        outcome = &mut requests => outcome,
        outcome = &mut replies => outcome,
        outcome = &mut replica => outcome,
        _ = wait_for_shutdown(shutdown) => Outcome::closed(Side::Shutdown),
    };

    if outcome.ended_by == Side::Shutdown {
        writer_cancel.cancel();
        reader_cancel.cancel();
        let drain = async { tokio::join!(replies, replica) };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok((writer_drained, reader_drained)) => debug!(
                writer = ?writer_drained.ended_by,
                reader = ?reader_drained.ended_by,
                "drained backend replies"
            ),
            Err(_) => {
                debug!("client not reading, abandoning backend replies");
                outcome.abandoned = true;
            }
        }
    }

    outcome.writer_readonly = readonly.load(Ordering::Relaxed);
    outcome
}

/// Copy until `from` reaches EOF or either side fails.
async fn copy<R, W>(reader: &mut R, writer: &mut W, from: Side, to: Side) -> Outcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Outcome::closed(from),
            Ok(n) => n,
            Err(e) => return Outcome::failed(from, e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return Outcome::failed(to, e);
        }
    }
}

/// Like [`copy`] into the shared client write half.
async fn copy_shared<R, W>(reader: &mut R, client: &Mutex<W>) -> Outcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Outcome::closed(Side::Reader),
            Ok(n) => n,
            Err(e) => return Outcome::failed(Side::Reader, e),
        };
        if let Err(e) = client.lock().await.write_all(&buf[..n]).await {
            return Outcome::failed(Side::Client, e);
        }
    }
}

async fn forward_commands<R, W1, W2>(
    client: R,
    writer: &mut W1,
    reader: &mut W2,
    metrics: &Metrics,
) -> Outcome
where
    R: AsyncRead + Unpin,
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    let mut parser = Parser::with_tee(client);
    loop {
        let command = match parser.parse().await {
            Ok(Some(command)) => command,
            Ok(None) => return Outcome::closed(Side::Client),
            Err(e) => return Outcome::failed(Side::Client, e),
        };
        let raw = parser.take_raw();

        if let Some(name) = command_name(&command) {
            if name != UNCOUNTED_COMMAND {
                metrics.record_command(&name);
            }
        }

        let (side, result) = match route(classify(&command)) {
            Route::Reader => (Side::Reader, reader.write_all(&raw).await),
            Route::Writer => (Side::Writer, writer.write_all(&raw).await),
        };
        if let Err(e) = result {
            return Outcome::failed(side, e);
        }
    }
}

/// Forward writer replies one message at a time, watching for READONLY.
async fn forward_replies<R, W>(backend: R, client: &Mutex<W>, readonly: &AtomicBool) -> Outcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parser = Parser::with_tee(backend);
    loop {
        let reply = match parser.parse().await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Outcome::closed(Side::Writer),
            Err(e) => return Outcome::failed(Side::Writer, e),
        };

        if reply
            .as_error()
            .is_some_and(|text| text.starts_with(READONLY_PREFIX))
            && !readonly.swap(true, Ordering::Relaxed)
        {
            warn!("writer answered READONLY, connection will not be reused");
        }

        let raw = parser.take_raw();
        if let Err(e) = client.lock().await.write_all(&raw).await {
            return Outcome::failed(Side::Client, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_resp::{encode_command, Message};

    #[tokio::test]
    async fn test_copy_reports_eof_side() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut sink = Vec::new();

        client.write_all(b"hello").await.unwrap();
        drop(client);

        let outcome = copy(&mut server, &mut sink, Side::Writer, Side::Client).await;
        assert_eq!(outcome.ended_by, Side::Writer);
        assert!(outcome.error.is_none());
        assert_eq!(sink, b"hello");
        assert!(!outcome.reusable(Side::Writer));
        assert!(outcome.reusable(Side::Reader));
    }

    #[test]
    fn test_abandoned_drain_blocks_reuse() {
        let mut outcome = Outcome::closed(Side::Shutdown);
        assert!(outcome.reusable(Side::Writer));
        assert!(outcome.reusable(Side::Reader));

        outcome.abandoned = true;
        assert!(!outcome.reusable(Side::Writer));
        assert!(!outcome.reusable(Side::Reader));
    }

    #[tokio::test]
    async fn test_forward_commands_splits_by_kind() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut writer = Vec::new();
        let mut reader = Vec::new();
        let metrics = Metrics::new().unwrap();

        let get = encode_command(["GET", "k"]);
        let set = encode_command(["SET", "k", "v"]);
        let command = encode_command(["COMMAND"]);
        client.write_all(&get).await.unwrap();
        client.write_all(&set).await.unwrap();
        client.write_all(&command).await.unwrap();
        client.write_all(b"+PING\r\n").await.unwrap();
        drop(client);

        let outcome = forward_commands(server, &mut writer, &mut reader, &metrics).await;
        assert_eq!(outcome.ended_by, Side::Client);
        assert!(outcome.error.is_none());

        assert_eq!(reader, get.to_vec());
        let mut expected = set.to_vec();
        expected.extend_from_slice(&command);
        expected.extend_from_slice(b"+PING\r\n");
        assert_eq!(writer, expected);

        let (_, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(r#"redis_commands_total{cmd="GET"} 1"#));
        assert!(text.contains(r#"redis_commands_total{cmd="SET"} 1"#));
        assert!(!text.contains(r#"cmd="COMMAND""#));
    }

    #[tokio::test]
    async fn test_forward_commands_rejects_garbage() {
        let (mut client, server) = tokio::io::duplex(64);
        let metrics = Metrics::new().unwrap();
        client.write_all(b"?what\r\n").await.unwrap();

        let outcome = forward_commands(server, &mut Vec::new(), &mut Vec::new(), &metrics).await;
        assert_eq!(outcome.ended_by, Side::Client);
        assert!(matches!(outcome.error, Some(RelayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_forward_replies_flags_readonly() {
        let (mut backend, server) = tokio::io::duplex(1024);
        let client = Mutex::new(Vec::new());
        let readonly = AtomicBool::new(false);

        let error = Message::error("READONLY You can't write against a read only replica.");
        backend.write_all(b"+OK\r\n").await.unwrap();
        backend.write_all(&error.to_bytes()).await.unwrap();
        drop(backend);

        let outcome = forward_replies(server, &client, &readonly).await;
        assert_eq!(outcome.ended_by, Side::Writer);
        assert!(readonly.load(Ordering::Relaxed));

        let mut expected = b"+OK\r\n".to_vec();
        expected.extend_from_slice(&error.to_bytes());
        assert_eq!(client.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_readonly() {
        let (mut backend, server) = tokio::io::duplex(1024);
        let client = Mutex::new(Vec::new());
        let readonly = AtomicBool::new(false);

        backend.write_all(b"-ERR unknown command\r\n").await.unwrap();
        drop(backend);

        forward_replies(server, &client, &readonly).await;
        assert!(!readonly.load(Ordering::Relaxed));
    }
}
