//! RESP2 message model and serialization.

use bytes::{BufMut, Bytes, BytesMut};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

pub(crate) const TYPE_SIMPLE_STRING: u8 = b'+';
pub(crate) const TYPE_ERROR: u8 = b'-';
pub(crate) const TYPE_INTEGER: u8 = b':';
pub(crate) const TYPE_BULK_STRING: u8 = b'$';
pub(crate) const TYPE_ARRAY: u8 = b'*';

pub(crate) const DELIMITER: &[u8] = b"\r\n";

/// A single RESP2 message.
///
/// `BulkString(None)` and `Array(None)` are the protocol's null values and
/// are distinct from the empty string and the empty array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<Message>>),
}

impl Message {
    pub fn simple(text: impl Into<String>) -> Self {
        Message::SimpleString(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Message::Error(text.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Message::BulkString(Some(data.into()))
    }

    pub fn null_bulk() -> Self {
        Message::BulkString(None)
    }

    pub fn array(items: Vec<Message>) -> Self {
        Message::Array(Some(items))
    }

    pub fn null_array() -> Self {
        Message::Array(None)
    }

    /// Elements of a non-null array.
    pub fn as_array(&self) -> Option<&[Message]> {
        match self {
            Message::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Payload of a non-null bulk string.
    pub fn as_bulk(&self) -> Option<&[u8]> {
        match self {
            Message::BulkString(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Text of an error reply.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Message::Error(text) => Some(text),
            _ => None,
        }
    }

    /// Append the wire encoding of this message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Message::SimpleString(text) => put_line(dst, TYPE_SIMPLE_STRING, text.as_bytes()),
            Message::Error(text) => put_line(dst, TYPE_ERROR, text.as_bytes()),
            Message::Integer(value) => put_line(dst, TYPE_INTEGER, value.to_string().as_bytes()),
            Message::BulkString(None) => put_line(dst, TYPE_BULK_STRING, b"-1"),
            Message::BulkString(Some(data)) => {
                put_line(dst, TYPE_BULK_STRING, data.len().to_string().as_bytes());
                dst.put_slice(data);
                dst.put_slice(DELIMITER);
            }
            Message::Array(None) => put_line(dst, TYPE_ARRAY, b"-1"),
            Message::Array(Some(items)) => {
                put_line(dst, TYPE_ARRAY, items.len().to_string().as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }

    /// Serialize this message into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }
}

fn put_line(dst: &mut BytesMut, kind: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.put_u8(kind);
    dst.put_slice(body);
    dst.put_slice(DELIMITER);
}

/// Encode a backend request.
///
/// Requests always go out as an array of bulk strings, one per argument,
/// whatever shape the proxy received them in.
pub fn encode_command<I, A>(args: I) -> Bytes
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let items = args
        .into_iter()
        .map(|arg| Message::bulk(Bytes::copy_from_slice(arg.as_ref())))
        .collect();
    Message::array(items).to_bytes()
}

/// JSON view of a reply: strings and integers map to their JSON
/// counterparts, errors to `{"error": text}`, nulls to `null`.
impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::SimpleString(text) => serializer.serialize_str(text),
            Message::Error(text) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", text)?;
                map.end()
            }
            Message::Integer(value) => serializer.serialize_i64(*value),
            Message::BulkString(None) | Message::Array(None) => serializer.serialize_none(),
            Message::BulkString(Some(data)) => {
                serializer.serialize_str(&String::from_utf8_lossy(data))
            }
            Message::Array(Some(items)) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}
