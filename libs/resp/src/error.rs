//! Error types for RESP parsing.

use std::io;

use thiserror::Error;

/// Errors raised while parsing a RESP2 byte stream.
///
/// A protocol error is fatal to the stream being parsed: the parser does not
/// try to resynchronise after one.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The leading type byte is not one of `+ - : $ *`.
    #[error("invalid RESP message type: {0:#04x}")]
    InvalidType(u8),

    /// A line carried no type byte at all.
    #[error("empty RESP line")]
    EmptyLine,

    /// An integer or length field was not a base-10 signed number.
    #[error("invalid integer: {0:?}")]
    InvalidInteger(String),

    /// A declared bulk or array length is out of range.
    #[error("invalid length: {0}")]
    InvalidLength(i64),

    /// A line or bulk body was not terminated by `\r\n`.
    #[error("missing CRLF delimiter")]
    MissingDelimiter,

    /// A line grew past [`crate::MAX_LINE_LEN`] without a terminator.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Simple string or error text was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidText(&'static str),

    /// The stream ended in the middle of a message.
    #[error("message truncated")]
    Truncated,

    /// The underlying stream failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

