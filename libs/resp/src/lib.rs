//! # tether-resp
//!
//! RESP2 wire codec shared by every tether proxy mode.
//!
//! ## Wire format
//!
//! ```text
//! +text\r\n                 simple string
//! -text\r\n                 error
//! :1000\r\n                 integer
//! $6\r\nfoobar\r\n          bulk string ($-1\r\n is null)
//! *2\r\n<elem><elem>        array (*-1\r\n is null)
//! ```
//!
//! ## Guarantees
//!
//! - `parse(serialize(m)) == m` for every representable message
//! - `serialize(parse(b)) == b` byte-for-byte for every well-formed input
//! - A null bulk string / array never compares equal to an empty one
//!
//! The read/write splitter relies on the second guarantee: it forwards the
//! exact bytes the [`Parser`] consumed, not a re-encoding.

pub mod command;
mod error;
mod message;
mod parser;

pub use command::{classify, command_name, CommandKind};
pub use error::ProtocolError;
pub use message::{encode_command, Message};
pub use parser::{Parser, MAX_BULK_LEN, MAX_LINE_LEN};
