//! Mock backends for tether's integration tests.
//!
//! Each backend binds an ephemeral port, serves every accepted connection on
//! its own task, and stops accepting when dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tether_resp::{Message, Parser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Builds the reply to one parsed command.
pub type Responder = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// What a backend does with each accepted connection.
#[derive(Clone)]
pub enum Behavior {
    /// Write back every byte received.
    Echo,
    /// Read and discard, never reply. Keeps the connection open until the
    /// peer closes it.
    Silent,
    /// Parse RESP commands and answer each one.
    Resp(Responder),
}

pub struct MockBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    commands: Arc<Mutex<Vec<Message>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockBackend {
    pub async fn echo() -> io::Result<Self> {
        Self::spawn("127.0.0.1:0", Behavior::Echo).await
    }

    pub async fn silent() -> io::Result<Self> {
        Self::spawn("127.0.0.1:0", Behavior::Silent).await
    }

    pub async fn resp<F>(responder: F) -> io::Result<Self>
    where
        F: Fn(&Message) -> Message + Send + Sync + 'static,
    {
        Self::spawn("127.0.0.1:0", Behavior::Resp(Arc::new(responder))).await
    }

    /// A RESP backend that answers every command with its own name as a
    /// bulk string, so tests can tell which backend served a request.
    pub async fn named(name: &'static str) -> io::Result<Self> {
        Self::resp(move |_| Message::bulk(name)).await
    }

    pub async fn spawn(bind: &str, behavior: Behavior) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let commands_clone = Arc::clone(&commands);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let behavior = behavior.clone();
                                let commands = Arc::clone(&commands_clone);
                                tokio::spawn(serve(stream, behavior, commands));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            commands,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Commands parsed so far, in arrival order. Only RESP backends record.
    pub fn commands(&self) -> Vec<Message> {
        match self.commands.lock() {
            Ok(commands) => commands.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve(mut stream: TcpStream, behavior: Behavior, commands: Arc<Mutex<Vec<Message>>>) {
    match behavior {
        Behavior::Echo => {
            let mut buf = vec![0u8; 8192];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        Behavior::Silent => {
            let mut buf = vec![0u8; 8192];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        }
        Behavior::Resp(responder) => {
            let (read, mut write) = stream.split();
            let mut parser = Parser::new(read);
            let mut out = BytesMut::new();

            loop {
                let command = match parser.parse().await {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "mock backend received malformed input");
                        break;
                    }
                };

                responder(&command).encode(&mut out);
                match commands.lock() {
                    Ok(mut seen) => seen.push(command),
                    Err(poisoned) => poisoned.into_inner().push(command),
                }

                if write.write_all(&out.split()).await.is_err() {
                    break;
                }
            }
        }
    }
}
