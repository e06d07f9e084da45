//! Redis Streams-backed outbound bus for stock updates (feature `redis`).
//!
//! Each [`StockUpdated`] becomes one `XADD` on the price-update stream:
//!
//! ```text
//! XADD stockflow:price-updates * sku ABC stock 7 source inventory-processor payload {...}
//! ```
//!
//! The flat fields let consumers filter without decoding; `payload` carries the JSON
//! document. Downstream services read the stream with their own consumer groups;
//! [`EventBus::subscribe`] here is a plain tail of the stream for dev tooling and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, error, instrument};

use stockflow_events::{EventBus, Subscription};
use stockflow_inventory::StockUpdated;

use crate::streams::{RedisStreamsError, command_error, connection, parse_read_reply};

/// Default stream key for outbound stock updates.
pub const DEFAULT_STREAM_KEY: &str = "stockflow:price-updates";

const PAYLOAD_FIELD: &str = "payload";
const SUBSCRIBE_BLOCK_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
}

impl RedisStreamsEventBus {
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    #[instrument(
        skip(self, event),
        fields(stream_key = %self.stream_key, sku = %event.sku, stock = event.stock),
        err
    )]
    fn publish_sync(&self, event: &StockUpdated) -> Result<String, RedisStreamsError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = connection(&self.client)?;

        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("sku")
            .arg(event.sku.as_str())
            .arg("stock")
            .arg(event.stock)
            .arg("source")
            .arg(&event.source)
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| command_error("XADD", e))
    }

    /// Read entries after `last_id`, blocking up to `block_ms`.
    fn read_after(
        &self,
        conn: &mut redis::Connection,
        last_id: &str,
        block_ms: u64,
    ) -> Result<Vec<(String, StockUpdated)>, RedisStreamsError> {
        let reply: redis::Value = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(100)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(last_id)
            .query(conn)
            .map_err(|e| command_error("XREAD", e))?;

        let mut events = Vec::new();
        for entry in parse_read_reply(&reply, &self.stream_key)? {
            let Some(payload) = entry.fields.as_ref().and_then(|f| f.get(PAYLOAD_FIELD)) else {
                continue;
            };
            match serde_json::from_str::<StockUpdated>(payload) {
                Ok(event) => events.push((entry.id.clone(), event)),
                Err(e) => {
                    debug!(message_id = %entry.id, error = %e, "skipping undecodable stock update")
                }
            }
        }
        Ok(events)
    }

    /// Forward entries to `tx` until `open` is cleared or the receiver goes away.
    fn tail(&self, tx: &mpsc::Sender<StockUpdated>, open: &AtomicBool) {
        let mut last_id = "$".to_string();
        let mut conn = None;

        while open.load(Ordering::Acquire) {
            if conn.is_none() {
                match connection(&self.client) {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        error!(error = %e, "stock update subscription cannot connect");
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            match self.read_after(c, &last_id, SUBSCRIBE_BLOCK_MS) {
                Ok(events) => {
                    for (id, event) in events {
                        last_id = id;
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to read stock updates");
                    conn = None;
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        debug!(stream_key = %self.stream_key, "stock update subscription closed");
    }
}

impl EventBus<StockUpdated> for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    fn publish(&self, message: StockUpdated) -> Result<(), Self::Error> {
        self.publish_sync(&message).map(|_| ())
    }

    /// Tail the stream from "now" on a background thread.
    ///
    /// The thread exits within one read block after the subscription is dropped.
    fn subscribe(&self) -> Subscription<StockUpdated> {
        let (tx, rx) = mpsc::channel();
        let subscription = Subscription::new(rx);
        let open = subscription.open_flag();
        let bus = self.clone();

        std::thread::spawn(move || bus.tail(&tx, &open));

        subscription
    }
}
