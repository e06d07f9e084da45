//! Shared Redis Streams plumbing (feature `redis`): errors and entry decoding.
//!
//! Raw reply shapes handled here:
//!
//! - entry: `[id, [field1, value1, field2, value2, ...]]`
//! - `XREADGROUP` / `XREAD`: `[[stream_key, [entry, ...]], ...]` or nil on timeout
//! - `XCLAIM`: `[entry, ...]` (a deleted entry may come back with nil fields)

use std::collections::BTreeMap;

use stockflow_events::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

impl From<RedisStreamsError> for QueueError {
    fn from(value: RedisStreamsError) -> Self {
        match value {
            RedisStreamsError::Connection(msg) => QueueError::Unavailable(msg),
            other => QueueError::Command(other.to_string()),
        }
    }
}

/// Classify a failed command: connectivity problems become `Connection`, a missing
/// stream or consumer group (`NOGROUP`) becomes `ConsumerGroup`.
pub(crate) fn command_error(context: &str, err: redis::RedisError) -> RedisStreamsError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        RedisStreamsError::Connection(format!("{context}: {err}"))
    } else if err.code() == Some("NOGROUP") {
        RedisStreamsError::ConsumerGroup(format!("{context} failed: {err}"))
    } else {
        RedisStreamsError::Command(format!("{context} failed: {err}"))
    }
}

pub(crate) fn connection(client: &redis::Client) -> Result<redis::Connection, RedisStreamsError> {
    client
        .get_connection()
        .map_err(|e| RedisStreamsError::Connection(e.to_string()))
}

/// One decoded stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamEntry {
    pub id: String,
    /// `None` when the entry was deleted from the stream but still pending.
    pub fields: Option<BTreeMap<String, String>>,
}

fn text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn parse_entry(entry: &redis::Value) -> Result<StreamEntry, RedisStreamsError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(RedisStreamsError::Deserialization("entry is not an array".to_string()));
    };
    let id = parts
        .first()
        .and_then(text)
        .ok_or_else(|| RedisStreamsError::Deserialization("entry without id".to_string()))?;

    let fields = match parts.get(1) {
        Some(redis::Value::Bulk(raw)) => {
            let mut fields = BTreeMap::new();
            for pair in raw.chunks(2) {
                if let [key, value] = pair {
                    if let (Some(k), Some(v)) = (text(key), text(value)) {
                        fields.insert(k, v);
                    }
                }
            }
            Some(fields)
        }
        Some(redis::Value::Nil) | None => None,
        Some(_) => {
            return Err(RedisStreamsError::Deserialization(format!(
                "entry {id} has malformed fields"
            )));
        }
    };

    Ok(StreamEntry { id, fields })
}

/// Decode a flat list of entries (`XCLAIM`, `XRANGE`).
pub(crate) fn parse_entries(reply: &redis::Value) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    match reply {
        redis::Value::Nil => Ok(Vec::new()),
        redis::Value::Bulk(entries) => entries
            .iter()
            .filter(|e| !matches!(e, redis::Value::Nil))
            .map(parse_entry)
            .collect(),
        _ => Err(RedisStreamsError::Deserialization("expected an entry list".to_string())),
    }
}

/// Decode an `XREAD`/`XREADGROUP` reply, keeping only entries of `stream_key`.
pub(crate) fn parse_read_reply(
    reply: &redis::Value,
    stream_key: &str,
) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    let redis::Value::Bulk(streams) = reply else {
        return Ok(Vec::new());
    };

    for stream in streams {
        let redis::Value::Bulk(pair) = stream else {
            continue;
        };
        if pair.first().and_then(text).as_deref() == Some(stream_key) {
            return match pair.get(1) {
                Some(entries) => parse_entries(entries),
                None => Ok(Vec::new()),
            };
        }
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use redis::Value;

    use super::*;

    fn server_error(reply: &str) -> redis::RedisError {
        redis::parse_redis_value(reply.as_bytes()).unwrap_err()
    }

    #[test]
    fn missing_group_is_a_consumer_group_error() {
        let err = command_error(
            "XREADGROUP",
            server_error("-NOGROUP No such key 'orders' or consumer group 'g'\r\n"),
        );
        assert!(matches!(err, RedisStreamsError::ConsumerGroup(_)), "{err:?}");

        let err = command_error("XADD", server_error("-ERR wrong number of arguments\r\n"));
        assert!(matches!(err, RedisStreamsError::Command(_)), "{err:?}");
    }

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        let flat = fields
            .iter()
            .flat_map(|(k, v)| [data(k), data(v)])
            .collect();
        Value::Bulk(vec![data(id), Value::Bulk(flat)])
    }

    #[test]
    fn decodes_xreadgroup_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("orders"),
            Value::Bulk(vec![
                entry("1-0", &[("body", "{}"), ("traceparent", "00-ab")]),
                entry("2-0", &[("body", "[]")]),
            ]),
        ])]);

        let entries = parse_read_reply(&reply, "orders").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        let fields = entries[0].fields.as_ref().unwrap();
        assert_eq!(fields.get("traceparent").map(String::as_str), Some("00-ab"));
    }

    #[test]
    fn timeout_reply_is_empty() {
        assert!(parse_read_reply(&Value::Nil, "orders").unwrap().is_empty());
    }

    #[test]
    fn deleted_claimed_entries_have_no_fields() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![data("3-0"), Value::Nil])]);
        let entries = parse_entries(&reply).unwrap();
        assert_eq!(entries[0].fields, None);
    }

    #[test]
    fn connection_errors_map_to_unavailable() {
        let err: QueueError = RedisStreamsError::Connection("refused".into()).into();
        assert!(matches!(err, QueueError::Unavailable(_)));
        let err: QueueError = RedisStreamsError::Command("XACK failed".into()).into();
        assert!(matches!(err, QueueError::Command(_)));
    }
}
