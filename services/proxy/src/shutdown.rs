//! Shutdown signalling.
//!
//! Shutdown runs in two phases. Draining starts on the termination signal:
//! health checks start failing but the listener keeps accepting. After the
//! lameduck interval the stop phase closes the listener and tells every relay
//! to wind down.

use std::io;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Resolve once the flag is `true` or its sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Owns both shutdown phases.
#[derive(Debug)]
pub struct Shutdown {
    draining: watch::Sender<bool>,
    stopping: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            draining: watch::channel(false).0,
            stopping: watch::channel(false).0,
        }
    }

    /// Flips when draining starts.
    pub fn draining(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    /// Flips when the listener should stop and relays should end.
    pub fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    /// Start draining, wait out the lameduck interval, then stop.
    pub async fn run(&self, lameduck: Duration) {
        self.draining.send_replace(true);
        info!(lameduck_ms = lameduck.as_millis() as u64, "draining");

        tokio::time::sleep(lameduck).await;

        self.stopping.send_replace(true);
        info!("stopping listener and relays");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the listener and the monitor server together, giving up once
/// `grace` has elapsed. Returns `false` on timeout.
pub async fn join_within(
    grace: Duration,
    listener: JoinHandle<()>,
    monitor: JoinHandle<io::Result<()>>,
) -> bool {
    let finished = async { tokio::join!(listener, monitor) };
    match tokio::time::timeout(grace, finished).await {
        Ok((listener, monitor)) => {
            if let Err(e) = listener {
                error!(error = %e, "listener task panicked");
            }
            match monitor {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "monitor server error"),
                Err(e) => error!(error = %e, "monitor task panicked"),
            }
            true
        }
        Err(_) => {
            warn!("relays or monitor server did not finish within the grace period");
            false
        }
    }
}
