//! Liveness probe for idle backend sockets.
//!
//! An idle keep-alive socket whose peer went away looks fine until it is
//! used. The probe peeks at the socket without blocking and without
//! consuming anything: a silent peer is alive, anything else is not.

use tokio::net::TcpStream;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as imp;

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
use fallback as imp;

/// Returns `true` only when a non-blocking peek would block.
pub(crate) fn is_alive(stream: &TcpStream) -> bool {
    imp::is_alive(stream)
}
