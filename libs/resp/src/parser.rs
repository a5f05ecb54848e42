//! Streaming RESP2 parser.
//!
//! The parser pulls bytes from any [`AsyncRead`] into an internal buffer and
//! yields one top-level [`Message`] per call. Nested arrays are parsed with an
//! explicit stack, so deeply nested input cannot overflow the task stack.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;
use crate::message::{
    Message, DELIMITER, TYPE_ARRAY, TYPE_BULK_STRING, TYPE_ERROR, TYPE_INTEGER,
    TYPE_SIMPLE_STRING,
};

/// Longest header or simple-string line accepted before giving up.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Largest bulk string accepted (Redis' default `proto-max-bulk-len`).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Most space reserved from a bulk header alone. The rest is allocated as
/// payload bytes arrive.
const MAX_BULK_RESERVE: usize = 64 * 1024;

/// Parses RESP2 messages from a byte stream.
///
/// In tee mode every byte consumed is also recorded, and [`Parser::take_raw`]
/// hands back exactly the bytes of the messages parsed since the last call.
pub struct Parser<R> {
    reader: R,
    buffer: BytesMut,
    raw: Option<BytesMut>,
}

impl<R: AsyncRead + Unpin> Parser<R> {
    /// Create a parser that only decodes.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            raw: None,
        }
    }

    /// Create a parser that also records the raw bytes it consumes.
    pub fn with_tee(reader: R) -> Self {
        Self {
            raw: Some(BytesMut::with_capacity(READ_CHUNK)),
            ..Self::new(reader)
        }
    }

    /// Raw bytes consumed since the previous call. Empty when not in tee mode.
    pub fn take_raw(&mut self) -> Bytes {
        self.raw
            .as_mut()
            .map(|raw| raw.split().freeze())
            .unwrap_or_default()
    }

    /// Parse the next top-level message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between messages. An
    /// end of stream inside a message is [`ProtocolError::Truncated`].
    pub async fn parse(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.buffer.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }

        // Open arrays: (declared length, elements parsed so far).
        let mut stack: Vec<(usize, Vec<Message>)> = Vec::new();

        'outer: loop {
            let line = self.read_line().await?;
            let (&kind, body) = line.split_first().ok_or(ProtocolError::EmptyLine)?;

            let mut message = match kind {
                TYPE_SIMPLE_STRING => Message::SimpleString(text(body, "simple string")?),
                TYPE_ERROR => Message::Error(text(body, "error")?),
                TYPE_INTEGER => Message::Integer(parse_decimal(body)?),
                TYPE_BULK_STRING => match parse_decimal(body)? {
                    -1 => Message::BulkString(None),
                    len @ 0..=MAX_BULK_LEN => {
                        Message::BulkString(Some(self.read_bulk(len as usize).await?))
                    }
                    len => return Err(ProtocolError::InvalidLength(len)),
                },
                TYPE_ARRAY => match parse_decimal(body)? {
                    -1 => Message::Array(None),
                    0 => Message::Array(Some(Vec::new())),
                    len if len > 0 => {
                        let len = len as usize;
                        stack.push((len, Vec::with_capacity(len.min(1024))));
                        continue;
                    }
                    len => return Err(ProtocolError::InvalidLength(len)),
                },
                other => return Err(ProtocolError::InvalidType(other)),
            };

            while let Some((expected, mut items)) = stack.pop() {
                items.push(message);
                if items.len() < expected {
                    stack.push((expected, items));
                    continue 'outer;
                }
                message = Message::Array(Some(items));
            }

            return Ok(Some(message));
        }
    }

    async fn fill(&mut self) -> Result<usize, ProtocolError> {
        if self.buffer.capacity() - self.buffer.len() < READ_CHUNK / 2 {
            self.buffer.reserve(READ_CHUNK);
        }
        Ok(self.reader.read_buf(&mut self.buffer).await?)
    }

    fn consume(&mut self, n: usize) -> Bytes {
        let chunk = self.buffer.split_to(n).freeze();
        if let Some(raw) = self.raw.as_mut() {
            raw.extend_from_slice(&chunk);
        }
        chunk
    }

    /// Read one CRLF-terminated line, returning it without the terminator.
    async fn read_line(&mut self) -> Result<Bytes, ProtocolError> {
        let mut searched = 0;
        loop {
            if let Some(pos) = self.buffer[searched..].iter().position(|b| *b == b'\n') {
                let end = searched + pos;
                if end == 0 || self.buffer[end - 1] != b'\r' {
                    return Err(ProtocolError::MissingDelimiter);
                }
                let line = self.consume(end + 1);
                return Ok(line.slice(..end - 1));
            }

            searched = self.buffer.len();
            if searched > MAX_LINE_LEN {
                return Err(ProtocolError::LineTooLong(MAX_LINE_LEN));
            }
            if self.fill().await? == 0 {
                return Err(ProtocolError::Truncated);
            }
        }
    }

    async fn read_bulk(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        let total = len + DELIMITER.len();
        if self.buffer.len() < total {
            self.buffer
                .reserve((total - self.buffer.len()).min(MAX_BULK_RESERVE));
        }
        while self.buffer.len() < total {
            if self.fill().await? == 0 {
                return Err(ProtocolError::Truncated);
            }
        }

        let chunk = self.consume(total);
        if &chunk[len..] != DELIMITER {
            return Err(ProtocolError::MissingDelimiter);
        }
        Ok(chunk.slice(..len))
    }
}

fn text(body: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(body.to_vec()).map_err(|_| ProtocolError::InvalidText(what))
}

/// Strict canonical base-10: an optional `-` followed by digits, with no
/// leading zeros and no `-0`. Anything else would not re-encode to the same
/// bytes.
fn parse_decimal(body: &[u8]) -> Result<i64, ProtocolError> {
    let invalid = || ProtocolError::InvalidInteger(String::from_utf8_lossy(body).into_owned());

    let (negative, digits) = match body.strip_prefix(b"-") {
        Some(digits) => (true, digits),
        None => (false, body),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    if digits[0] == b'0' && (digits.len() > 1 || negative) {
        return Err(invalid());
    }

    std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(invalid)
}
