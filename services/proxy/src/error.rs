//! Error types for relayed connections.

use std::io;

use tether_pool::PoolError;
use tether_resp::ProtocolError;
use thiserror::Error;

/// Why a relay ended abnormally.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No backend connection could be checked out.
    #[error("no connection to {upstream}: {source}")]
    Checkout {
        upstream: String,
        #[source]
        source: PoolError,
    },

    /// The client or a backend sent bytes that are not RESP.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A socket failed mid-relay.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Checkout failures are operational problems. Everything else is a
    /// peer going away.
    pub fn is_checkout(&self) -> bool {
        matches!(self, RelayError::Checkout { .. })
    }
}
