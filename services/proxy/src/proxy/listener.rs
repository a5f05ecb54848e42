//! Client listener and per-connection handling.
//!
//! Each accepted client gets its own task holding one writer connection and,
//! with reader routing on, one reader connection. The listener keeps
//! accepting through the draining phase and closes when the stop phase
//! begins. [`Listener::run`] returns once every relay has finished.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_pool::Connection;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::relay::{self, Outcome, Side};
use super::router::{Upstream, Upstreams};
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::shutdown::wait_for_shutdown;

/// Shared by every relay.
pub struct ProxyState {
    pub upstreams: Upstreams,
    pub metrics: Arc<Metrics>,
}

/// Accepts clients and relays them to the upstreams.
pub struct Listener {
    listener: TcpListener,
    /// One permit per concurrent relay.
    conn_semaphore: Arc<Semaphore>,
    state: Arc<ProxyState>,
}

impl Listener {
    /// Bind `addr`. A `max_connections` of zero means unbounded.
    pub async fn bind(addr: &str, max_connections: usize, state: Arc<ProxyState>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let permits = match max_connections {
            0 => Semaphore::MAX_PERMITS,
            n => n.min(Semaphore::MAX_PERMITS),
        };

        info!(
            bind_addr = %listener.local_addr()?,
            max_connections = permits,
            splitting = state.upstreams.is_splitting(),
            "listener bound"
        );

        Ok(Self {
            listener,
            conn_semaphore: Arc::new(Semaphore::new(permits)),
            state,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` flips, then wait for in-flight relays.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Listener {
            listener,
            conn_semaphore,
            state,
        } = self;
        let mut relays = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let semaphore = Arc::clone(&conn_semaphore);
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        relays.spawn(
                            serve(stream, semaphore, state, shutdown)
                                .instrument(tracing::info_span!("connection", peer_addr = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                        // Avoid a tight loop on persistent errors such as EMFILE.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = relays.join_next(), if !relays.is_empty() => log_join(joined),
            }
        }

        drop(listener);
        info!(in_flight = relays.len(), "listener closed, waiting for relays");

        while let Some(joined) = relays.join_next().await {
            log_join(joined);
        }
        info!("all relays finished");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "relay panicked");
        }
    }
}

/// Wait for a relay slot, then relay the client.
async fn serve(
    client: TcpStream,
    semaphore: Arc<Semaphore>,
    state: Arc<ProxyState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
        _ = wait_for_shutdown(&mut shutdown) => {
            debug!("shut down while waiting for a relay slot");
            return;
        }
    };

    match handle_connection(client, &state, &mut shutdown).await {
        Ok(()) => debug!("connection closed"),
        Err(e) if e.is_checkout() => warn!(error = %e, "connection dropped"),
        Err(e) => debug!(error = %e, "connection error"),
    }
}

async fn handle_connection(
    mut client: TcpStream,
    state: &ProxyState,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let upstreams = &state.upstreams;
    let writer_upstream = upstreams.writer();
    let _writer_gauge = state.metrics.track_connection(&writer_upstream.addr);
    let mut writer = checkout(writer_upstream, upstreams.self_topology()).await?;

    let outcome = match upstreams.reader() {
        None => {
            let outcome = relay::plain(&mut client, &mut writer, shutdown).await;
            release(writer_upstream, writer, &outcome, Side::Writer);
            outcome
        }
        Some(reader_upstream) => {
            let _reader_gauge = state.metrics.track_connection(&reader_upstream.addr);
            let mut reader = match checkout(reader_upstream, upstreams.self_topology()).await {
                Ok(reader) => reader,
                Err(e) => {
                    writer_upstream.pool.put(writer);
                    return Err(e);
                }
            };

            let outcome =
                relay::split(&mut client, &mut writer, &mut reader, &state.metrics, shutdown).await;
            if outcome.writer_readonly {
                writer.mark_readonly();
            }
            release(writer_upstream, writer, &outcome, Side::Writer);
            release(reader_upstream, reader, &outcome, Side::Reader);
            outcome
        }
    };

    if outcome.ended_by == Side::Shutdown {
        // Half-close so the client sees EOF after the last drained reply.
        client.shutdown().await?;
    }

    match outcome.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn checkout(upstream: &Upstream, topology: &str) -> Result<Connection, RelayError> {
    let conn = upstream
        .pool
        .get(topology)
        .await
        .map_err(|source| RelayError::Checkout {
            upstream: upstream.addr.clone(),
            source,
        })?;
    debug!(
        upstream = %upstream.addr,
        connection_id = conn.id(),
        topology = conn.topology(),
        "checked out backend connection"
    );
    Ok(conn)
}

/// Return `conn` to its pool unless its side ended the relay.
fn release(upstream: &Upstream, conn: Connection, outcome: &Outcome, side: Side) {
    if outcome.reusable(side) {
        upstream.pool.put(conn);
    } else {
        debug!(upstream = %upstream.addr, connection_id = conn.id(), "closing backend connection");
    }
}
