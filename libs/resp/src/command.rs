//! Read/write classification of client commands.
//!
//! Only the verb of a top-level array is inspected. The verb table is a
//! closed allow-list: anything not listed as read-only is a write, so an
//! unknown or new command can never be sent to a replica by accident.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::message::Message;

/// Where a command may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Safe to serve from a read replica.
    Read,
    /// Must go to the primary.
    Write,
}

const READ_ONLY_VERBS: &[&str] = &[
    // generic
    "PING", "EXISTS", "EXPIRETIME", "KEYS", "SCAN",
    // strings
    "GET", "GETRANGE", "MGET", "STRLEN",
    // hashes
    "HEXISTS", "HGET", "HGETALL", "HKEYS", "HLEN", "HMGET", "HSCAN", "HSTRLEN", "HVALS",
    // lists
    "LINDEX", "LLEN", "LRANGE",
    // sets
    "SCARD", "SINTER", "SINTERCARD", "SISMEMBER", "SMEMBERS", "SMISMEMBER", "SRANDMEMBER",
    "SSCAN", "SUNION",
    // sorted sets
    "ZCARD", "ZCOUNT", "ZDIFF", "ZINTER", "ZINTERCARD", "ZLEXCOUNT", "ZMSCORE", "ZRANDMEMBER",
    "ZRANGE", "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREVRANGE", "ZREVRANGEBYLEX",
    "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCAN", "ZSCORE", "ZUNION",
    // search
    "FT.SEARCH",
];

static VERB_TABLE: LazyLock<HashMap<&'static str, CommandKind>> = LazyLock::new(|| {
    READ_ONLY_VERBS
        .iter()
        .map(|verb| (*verb, CommandKind::Read))
        .collect()
});

/// Classify a verb, case-insensitively.
pub fn classify_verb(verb: &[u8]) -> CommandKind {
    let Ok(verb) = std::str::from_utf8(verb) else {
        return CommandKind::Write;
    };
    match VERB_TABLE.get(verb.to_ascii_uppercase().as_str()) {
        Some(kind) => *kind,
        None => CommandKind::Write,
    }
}

/// Classify a parsed top-level message.
///
/// Non-array messages, null or empty arrays, and arrays whose first element
/// is not a bulk string are writes.
pub fn classify(message: &Message) -> CommandKind {
    match verb(message) {
        Some(verb) => classify_verb(verb),
        None => CommandKind::Write,
    }
}

/// Upper-cased verb of a command, for metrics labels.
pub fn command_name(message: &Message) -> Option<String> {
    verb(message).map(|v| String::from_utf8_lossy(v).to_ascii_uppercase())
}

fn verb(message: &Message) -> Option<&[u8]> {
    message.as_array()?.first()?.as_bulk()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> Message {
        Message::array(args.iter().map(|a| Message::bulk(a.to_string())).collect())
    }

    #[test]
    fn test_get_is_read() {
        assert_eq!(classify(&command(&["GET", "k"])), CommandKind::Read);
    }

    #[test]
    fn test_set_is_write() {
        assert_eq!(classify(&command(&["SET", "k", "v"])), CommandKind::Write);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(classify(&command(&["hgetall", "h"])), CommandKind::Read);
        assert_eq!(classify(&command(&["Ft.Search", "idx", "*"])), CommandKind::Read);
    }

    #[test]
    fn test_unknown_verb_is_write() {
        assert_eq!(classify(&command(&["NOTACOMMAND"])), CommandKind::Write);
        assert_eq!(classify(&command(&["COMMAND"])), CommandKind::Write);
    }

    #[test]
    fn test_non_command_shapes_are_writes() {
        let shapes = [
            Message::simple("GET"),
            Message::Integer(1),
            Message::null_array(),
            Message::array(vec![]),
            Message::array(vec![Message::simple("GET")]),
            Message::array(vec![Message::null_bulk()]),
        ];
        for shape in shapes {
            assert_eq!(classify(&shape), CommandKind::Write, "{:?}", shape);
        }
    }

    #[test]
    fn test_every_table_entry_is_read() {
        for verb in READ_ONLY_VERBS {
            assert_eq!(classify_verb(verb.as_bytes()), CommandKind::Read, "{verb}");
            assert_eq!(
                classify_verb(verb.to_ascii_lowercase().as_bytes()),
                CommandKind::Read,
                "{verb}"
            );
        }
    }

    #[test]
    fn test_command_name() {
        assert_eq!(
            command_name(&command(&["get", "k"])).as_deref(),
            Some("GET")
        );
        assert_eq!(command_name(&Message::simple("PING")), None);
    }
}
