//! Redis Streams-backed order queue (durable, at-least-once delivery).
//!
//! ## Mapping onto queue semantics
//!
//! - **Receive**: `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <key> >`
//! - **Visibility window**: a delivered entry sits in the group's pending list. Once it
//!   has been idle longer than the visibility timeout, any consumer reclaims it with
//!   `XCLAIM` (which bumps its delivery count). Reclaimed entries are served before new
//!   ones.
//! - **Acknowledge**: `XACK`, guarded by a script that checks the entry is still owned by
//!   this consumer with the delivery count of our receipt. Otherwise the receipt is
//!   stale.
//! - **Dead-letter**: an entry whose delivery count would exceed `max_receive_count` is
//!   copied to the DLQ stream and acknowledged instead of being handed out again.
//!
//! ## Entry layout
//!
//! Producers write the JSON payload in the `body` field. Every other field is passed
//! through as a message attribute (e.g. `traceparent`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use stockflow_events::{AckToken, InFlightMessage, OrderQueue, QueueError, clamp_batch_size};

use crate::streams::{
    RedisStreamsError, StreamEntry, command_error, connection, parse_entries, parse_read_reply,
};

/// Field holding the message payload.
pub const BODY_FIELD: &str = "body";

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// XACK only if the entry is still pending for this consumer at this delivery count.
const GUARDED_ACK_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #pending == 0 then
    return 0
end
local entry = pending[1]
if entry[2] ~= ARGV[3] or tonumber(entry[4]) ~= tonumber(ARGV[4]) then
    return 0
end
return redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsOrderQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    dlq_key: String,
    visibility_timeout: Duration,
    max_receive_count: Option<u32>,
    ack_script: Arc<redis::Script>,
    group_ready: Arc<AtomicBool>,
}

impl RedisStreamsOrderQueue {
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        dlq_key: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: consumer.into(),
            dlq_key: dlq_key.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_receive_count: Some(DEFAULT_MAX_RECEIVE_COUNT),
            ack_script: Arc::new(redis::Script::new(GUARDED_ACK_SCRIPT)),
            group_ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// `None` disables dead-lettering.
    pub fn with_max_receive_count(mut self, limit: Option<u32>) -> Self {
        self.max_receive_count = limit.filter(|l| *l > 0);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    /// Create the consumer group (and stream) if missing. Idempotent.
    pub fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = connection(&self.client)?;

        // "0" so a fresh group also sees entries written before it existed.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => {
                return Err(match command_error("XGROUP CREATE", e) {
                    RedisStreamsError::Command(msg) => RedisStreamsError::ConsumerGroup(msg),
                    other => other,
                });
            }
        }

        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Append an order message (producer side; used by tools and tests).
    pub fn enqueue(
        &self,
        body: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, RedisStreamsError> {
        let mut conn = connection(&self.client)?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key).arg("*").arg(BODY_FIELD).arg(body);
        for (k, v) in attributes {
            cmd.arg(k).arg(v);
        }
        cmd.query(&mut conn).map_err(|e| command_error("XADD", e))
    }

    /// A vanished group (stream deleted, Redis restarted without persistence) makes the
    /// next poll recreate it.
    fn note_failure(&self, err: RedisStreamsError) -> RedisStreamsError {
        if matches!(err, RedisStreamsError::ConsumerGroup(_))
            && self.group_ready.swap(false, Ordering::AcqRel)
        {
            warn!(
                group = %self.group,
                error = %err,
                "consumer group missing; recreating on next poll"
            );
        }
        err
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key, group = %self.group), err)]
    fn poll_sync(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<InFlightMessage>, RedisStreamsError> {
        if !self.group_ready.load(Ordering::Acquire) {
            self.ensure_consumer_group()?;
        }
        self.read_batch(max_messages, wait).map_err(|e| self.note_failure(e))
    }

    fn read_batch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<InFlightMessage>, RedisStreamsError> {
        let count = clamp_batch_size(max_messages);
        let mut conn = connection(&self.client)?;

        let reclaimed = self.reclaim_expired(&mut conn, count)?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 would block forever.
        let block_ms = wait.as_millis() as u64;
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        let reply: redis::Value = cmd
            .query(&mut conn)
            .map_err(|e| command_error("XREADGROUP", e))?;

        let entries = parse_read_reply(&reply, &self.stream_key)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| self.to_message(entry, 1))
            .collect())
    }

    /// Claim entries whose visibility window expired, dead-lettering the exhausted ones.
    fn reclaim_expired(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<InFlightMessage>, RedisStreamsError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as u64;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query(conn)
            .map_err(|e| command_error("XPENDING", e))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let delivered: BTreeMap<String, u64> = pending
            .into_iter()
            .map(|(id, _consumer, _idle, times_delivered)| (id, times_delivered))
            .collect();
        let ids: Vec<&String> = delivered.keys().collect();

        let reply: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| command_error("XCLAIM", e))?;

        let mut messages = Vec::new();
        for entry in parse_entries(&reply)? {
            if entry.fields.is_none() {
                debug!(message_id = %entry.id, "dropping pending entry deleted from the stream");
                self.ack_ids(conn, &[entry.id.as_str()])?;
                continue;
            }

            let times_delivered = delivered.get(&entry.id).copied().unwrap_or(0);
            match redelivery(times_delivered, self.max_receive_count) {
                Redelivery::DeadLetter { receive_count } => {
                    self.dead_letter(conn, &entry, receive_count)?
                }
                Redelivery::Deliver { receive_count } => {
                    if let Some(message) = self.to_message(entry, receive_count) {
                        messages.push(message);
                    }
                }
            }
        }
        Ok(messages)
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        entry: &StreamEntry,
        receive_count: u32,
    ) -> Result<(), RedisStreamsError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&entry.id)
            .arg("receive_count")
            .arg(receive_count)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339());
        for (k, v) in entry.fields.iter().flatten() {
            cmd.arg(k).arg(v);
        }
        let _: String = cmd.query(conn).map_err(|e| command_error("DLQ XADD", e))?;

        self.ack_ids(conn, &[entry.id.as_str()])?;

        warn!(
            message_id = %entry.id,
            receive_count,
            dlq_key = %self.dlq_key,
            "message sent to dead-letter queue"
        );
        Ok(())
    }

    fn ack_ids(&self, conn: &mut redis::Connection, ids: &[&str]) -> Result<(), RedisStreamsError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(ids)
            .query(conn)
            .map_err(|e| command_error("XACK", e))?;
        Ok(())
    }

    fn to_message(&self, entry: StreamEntry, receive_count: u32) -> Option<InFlightMessage> {
        let mut attributes = entry.fields?;
        let body = attributes.remove(BODY_FIELD).unwrap_or_default();
        let receipt = receipt_for(&entry.id, receive_count);
        Some(InFlightMessage::new(entry.id, receipt, body, attributes, receive_count))
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id()), err)]
    fn acknowledge_sync(&self, message: InFlightMessage) -> Result<(), QueueError> {
        let (id, receive_count) =
            parse_receipt(message.receipt()).ok_or_else(|| QueueError::StaleReceipt {
                message_id: message.message_id().to_string(),
            })?;

        let mut conn = connection(&self.client)?;
        let acked: i64 = self
            .ack_script
            .key(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .arg(&self.consumer)
            .arg(receive_count)
            .invoke(&mut conn)
            .map_err(|e| self.note_failure(command_error("guarded XACK", e)))?;

        if acked == 0 {
            return Err(QueueError::StaleReceipt {
                message_id: message.message_id().to_string(),
            });
        }
        Ok(())
    }
}

/// Fate of a pending entry whose visibility window expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redelivery {
    Deliver { receive_count: u32 },
    DeadLetter { receive_count: u32 },
}

/// `times_delivered` is the group's delivery counter before reclaiming; `XCLAIM` bumps it.
/// An entry already received `limit` times is dead-lettered instead of handed out again.
fn redelivery(times_delivered: u64, limit: Option<u32>) -> Redelivery {
    let received = u32::try_from(times_delivered).unwrap_or(u32::MAX);
    match limit {
        Some(limit) if received >= limit => Redelivery::DeadLetter { receive_count: received },
        _ => Redelivery::Deliver {
            receive_count: received.saturating_add(1),
        },
    }
}

fn receipt_for(id: &str, receive_count: u32) -> AckToken {
    AckToken::new(format!("{id}#{receive_count}"))
}

fn parse_receipt(receipt: &AckToken) -> Option<(&str, u32)> {
    let (id, count) = receipt.as_str().rsplit_once('#')?;
    Some((id, count.parse().ok()?))
}

impl OrderQueue for RedisStreamsOrderQueue {
    fn poll(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<InFlightMessage>, QueueError> {
        Ok(self.poll_sync(max_messages, wait)?)
    }

    fn acknowledge(&self, message: InFlightMessage) -> Result<(), QueueError> {
        self.acknowledge_sync(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_queue() -> RedisStreamsOrderQueue {
        RedisStreamsOrderQueue::new("redis://127.0.0.1:1", "orders", "g", "c", "dlq").unwrap()
    }

    #[test]
    fn receipts_round_trip_ids_with_dashes() {
        let receipt = receipt_for("1718000000000-3", 2);
        assert_eq!(parse_receipt(&receipt), Some(("1718000000000-3", 2)));
        assert_eq!(parse_receipt(&AckToken::new("garbage")), None);
    }

    #[test]
    fn body_field_is_split_from_attributes() {
        let queue = unreachable_queue();
        let mut fields = BTreeMap::new();
        fields.insert(BODY_FIELD.to_string(), r#"{"sku":"ABC","quantity":1}"#.to_string());
        fields.insert("traceparent".to_string(), "00-ab".to_string());

        let message = queue
            .to_message(
                StreamEntry {
                    id: "1-0".to_string(),
                    fields: Some(fields),
                },
                3,
            )
            .unwrap();

        assert_eq!(message.body(), r#"{"sku":"ABC","quantity":1}"#);
        assert_eq!(message.attribute("traceparent"), Some("00-ab"));
        assert_eq!(message.attribute(BODY_FIELD), None);
        assert_eq!(message.receive_count(), 3);
        assert_eq!(message.receipt().as_str(), "1-0#3");
    }

    #[test]
    fn unreachable_server_is_systemic() {
        let queue = unreachable_queue();
        let err = queue.poll(10, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_systemic(), "{err:?}");
    }

    #[test]
    fn redelivery_counts_match_in_memory_queue() {
        use stockflow_events::InMemoryOrderQueue;

        let limit = 3;
        let memory =
            InMemoryOrderQueue::new(Duration::from_millis(5)).with_max_receive_count(limit);
        memory.send(r#"{"sku":"ABC","quantity":1}"#).unwrap();

        let mut times_delivered = 0;
        let mut dead_lettered = false;
        for _ in 0..10 {
            let batch = memory.poll(1, Duration::ZERO).unwrap();
            match batch.first() {
                Some(message) => {
                    assert_eq!(
                        redelivery(times_delivered, Some(limit)),
                        Redelivery::Deliver {
                            receive_count: message.receive_count()
                        }
                    );
                    times_delivered += 1;
                }
                None => {
                    let dead = memory.dead_letters();
                    assert_eq!(dead.len(), 1);
                    assert_eq!(
                        redelivery(times_delivered, Some(limit)),
                        Redelivery::DeadLetter {
                            receive_count: dead[0].receive_count
                        }
                    );
                    dead_lettered = true;
                    break;
                }
            }
            drop(batch);
            std::thread::sleep(Duration::from_millis(15));
        }

        assert!(dead_lettered);
        assert_eq!(times_delivered, u64::from(limit));
    }

    #[test]
    fn redelivery_without_limit_never_dead_letters() {
        assert_eq!(redelivery(0, None), Redelivery::Deliver { receive_count: 1 });
        assert_eq!(redelivery(41, None), Redelivery::Deliver { receive_count: 42 });
        assert_eq!(
            redelivery(u64::MAX, None),
            Redelivery::Deliver {
                receive_count: u32::MAX
            }
        );
        assert_eq!(redelivery(4, Some(5)), Redelivery::Deliver { receive_count: 5 });
        assert_eq!(redelivery(5, Some(5)), Redelivery::DeadLetter { receive_count: 5 });
    }

    #[test]
    fn missing_group_clears_ready_latch() {
        let queue = unreachable_queue();
        queue.group_ready.store(true, Ordering::Release);

        let nogroup =
            redis::parse_redis_value(b"-NOGROUP No such key 'orders' or consumer group 'g'\r\n")
                .unwrap_err();
        let err = queue.note_failure(command_error("XPENDING", nogroup));

        assert!(matches!(err, RedisStreamsError::ConsumerGroup(_)), "{err:?}");
        assert!(!queue.group_ready.load(Ordering::Acquire));
    }

    #[test]
    fn other_command_errors_keep_ready_latch() {
        let queue = unreachable_queue();
        queue.group_ready.store(true, Ordering::Release);

        queue.note_failure(RedisStreamsError::Command("XPENDING failed: ERR".to_string()));

        assert!(queue.group_ready.load(Ordering::Acquire));
    }

    #[test]
    fn zero_receive_limit_disables_dead_lettering() {
        let queue = unreachable_queue().with_max_receive_count(Some(0));
        assert_eq!(queue.max_receive_count, None);
    }

    /// Needs a reachable Redis: `REDIS_URL=... cargo test --features redis -- --ignored`.
    #[test]
    #[ignore]
    fn delivers_redelivers_and_dead_letters() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let suffix = uuid::Uuid::now_v7();
        let queue = RedisStreamsOrderQueue::new(
            &url,
            format!("stockflow:test:orders:{suffix}"),
            "settlement",
            "c-1",
            format!("stockflow:test:dlq:{suffix}"),
        )
        .unwrap()
        .with_visibility_timeout(Duration::from_millis(50))
        .with_max_receive_count(Some(2));
        queue.ensure_consumer_group().unwrap();

        queue.enqueue(r#"{"sku":"ABC","quantity":1}"#, &BTreeMap::new()).unwrap();

        let first = queue.poll(10, Duration::from_millis(100)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count(), 1);
        drop(first);

        std::thread::sleep(Duration::from_millis(80));
        let second = queue.poll(10, Duration::from_millis(100)).unwrap();
        assert_eq!(second[0].receive_count(), 2);
        drop(second);

        std::thread::sleep(Duration::from_millis(80));
        assert!(queue.poll(10, Duration::from_millis(100)).unwrap().is_empty());

        queue.enqueue(r#"{"sku":"ABC","quantity":2}"#, &BTreeMap::new()).unwrap();
        let mut batch = queue.poll(10, Duration::from_millis(100)).unwrap();
        queue.acknowledge(batch.remove(0)).unwrap();
    }
}
