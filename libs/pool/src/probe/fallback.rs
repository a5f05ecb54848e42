use tokio::net::TcpStream;

/// Without a non-blocking peek there is no way to tell, so idle sockets are
/// never trusted.
pub(super) fn is_alive(_stream: &TcpStream) -> bool {
    false
}
