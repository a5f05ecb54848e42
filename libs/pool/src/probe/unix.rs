use std::io;
use std::os::fd::AsRawFd;

use tokio::net::TcpStream;

pub(super) fn is_alive(stream: &TcpStream) -> bool {
    let fd = stream.as_raw_fd();
    let mut buf = [0u8; 1];

    // SAFETY: `fd` is owned by `stream`, which outlives the call, and `buf`
    // is a valid one-byte buffer.
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };

    if n >= 0 {
        // Unsolicited data (n > 0) or EOF (n == 0).
        return false;
    }

    io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock
}
