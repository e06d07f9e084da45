//! In-memory work queue for tests/dev.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::queue::{AckToken, DeadLetter, InFlightMessage, OrderQueue, QueueError, clamp_batch_size};

/// Default visibility window for received messages.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: BTreeMap<String, String>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    next_receipt: u64,
}

impl QueueState {
    fn dead_letter_exhausted(&mut self, now: Instant, limit: u32) {
        let mut idx = 0;
        while idx < self.messages.len() {
            let exhausted = {
                let m = &self.messages[idx];
                m.is_visible(now) && m.receive_count >= limit
            };
            if exhausted {
                let m = self.messages.remove(idx);
                tracing::warn!(
                    message_id = %m.message_id,
                    receive_count = m.receive_count,
                    "message moved to dead-letter list"
                );
                self.dead_letters.push(DeadLetter {
                    message_id: m.message_id,
                    body: m.body,
                    attributes: m.attributes,
                    receive_count: m.receive_count,
                    failed_at: Utc::now(),
                });
            } else {
                idx += 1;
            }
        }
    }

    fn take_visible(
        &mut self,
        max: usize,
        now: Instant,
        visibility: Duration,
    ) -> Vec<InFlightMessage> {
        let mut batch = Vec::new();
        for m in self.messages.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if !m.is_visible(now) {
                continue;
            }

            self.next_receipt += 1;
            let receipt = format!("{}#{}", m.message_id, self.next_receipt);
            m.receive_count += 1;
            m.invisible_until = now.checked_add(visibility);
            m.receipt = Some(receipt.clone());

            batch.push(InFlightMessage::new(
                m.message_id.clone(),
                AckToken::new(receipt),
                m.body.clone(),
                m.attributes.clone(),
                m.receive_count,
            ));
        }
        batch
    }

    /// Earliest instant at which a hidden message becomes visible again.
    fn next_visibility_change(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .filter_map(|m| m.invisible_until)
            .filter(|until| *until > now)
            .min()
    }
}

/// In-memory queue with long-poll, visibility timeout and optional dead-lettering.
///
/// - No IO
/// - Messages are handed out in insertion order
/// - Redelivery happens when the visibility window lapses without an acknowledgment
/// - With `max_receive_count`, a message received that many times without being
///   acknowledged is moved to [`InMemoryOrderQueue::dead_letters`]
#[derive(Debug)]
pub struct InMemoryOrderQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    visibility_timeout: Duration,
    max_receive_count: Option<u32>,
}

impl Default for InMemoryOrderQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl InMemoryOrderQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            visibility_timeout,
            max_receive_count: None,
        }
    }

    /// Dead-letter messages after `limit` unacknowledged receives (`0` disables).
    pub fn with_max_receive_count(mut self, limit: u32) -> Self {
        self.max_receive_count = (limit > 0).then_some(limit);
        self
    }

    /// Enqueue a message body; returns the generated message id.
    pub fn send(&self, body: impl Into<String>) -> Result<String, QueueError> {
        self.send_with_attributes(body, BTreeMap::new())
    }

    pub fn send_with_attributes(
        &self,
        body: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        let message_id = Uuid::now_v7().to_string();
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        state.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            attributes,
            receive_count: 0,
            invisible_until: None,
            receipt: None,
        });
        drop(state);

        self.available.notify_all();
        Ok(message_id)
    }

    /// Messages still owned by the queue (visible or in flight).
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by an unexpired visibility window.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .map(|s| s.messages.iter().filter(|m| !m.is_visible(now)).count())
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl OrderQueue for InMemoryOrderQueue {
    fn poll(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<InFlightMessage>, QueueError> {
        let max = clamp_batch_size(max_messages);
        let started = Instant::now();
        let deadline = started.checked_add(wait).unwrap_or(started);

        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        loop {
            let now = Instant::now();
            if let Some(limit) = self.max_receive_count {
                state.dead_letter_exhausted(now, limit);
            }

            let batch = state.take_visible(max, now, self.visibility_timeout);
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            let mut timeout = deadline - now;
            if let Some(next) = state.next_visibility_change(now) {
                timeout = timeout.min(next - now);
            }

            let (guard, _) = self
                .available
                .wait_timeout(state, timeout)
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }
    }

    fn acknowledge(&self, message: InFlightMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;

        let idx = state
            .messages
            .iter()
            .position(|m| m.message_id == message.message_id())
            .ok_or_else(|| QueueError::StaleReceipt {
                message_id: message.message_id().to_string(),
            })?;

        if state.messages[idx].receipt.as_deref() != Some(message.receipt().as_str()) {
            return Err(QueueError::StaleReceipt {
                message_id: message.message_id().to_string(),
            });
        }

        state.messages.remove(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::ZERO;

    #[test]
    fn empty_poll_times_out_with_empty_batch() {
        let queue = InMemoryOrderQueue::default();
        let started = Instant::now();
        let batch = queue.poll(10, Duration::from_millis(30)).unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn poll_respects_batch_limit_and_order() {
        let queue = InMemoryOrderQueue::default();
        for i in 0..15 {
            queue.send(format!("{{\"n\":{i}}}")).unwrap();
        }

        let first = queue.poll(50, NO_WAIT).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].body(), "{\"n\":0}");

        let second = queue.poll(10, NO_WAIT).unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[0].body(), "{\"n\":10}");
    }

    #[test]
    fn acknowledged_message_is_removed() {
        let queue = InMemoryOrderQueue::default();
        queue.send("a").unwrap();

        let mut batch = queue.poll(1, NO_WAIT).unwrap();
        queue.acknowledge(batch.remove(0)).unwrap();

        assert!(queue.is_empty());
    }

    #[test]
    fn unacknowledged_message_is_redelivered_after_visibility_timeout() {
        let queue = InMemoryOrderQueue::new(Duration::from_millis(20));
        let id = queue.send("a").unwrap();

        let first = queue.poll(1, NO_WAIT).unwrap();
        assert_eq!(first.len(), 1);
        drop(first);

        assert!(queue.poll(1, NO_WAIT).unwrap().is_empty());

        let again = queue.poll(1, Duration::from_millis(500)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id(), id);
        assert_eq!(again[0].receive_count(), 2);
    }

    #[test]
    fn stale_receipt_is_rejected_after_redelivery() {
        let queue = InMemoryOrderQueue::new(Duration::from_millis(10));
        queue.send("a").unwrap();

        let mut first = queue.poll(1, NO_WAIT).unwrap();
        let mut second = queue.poll(1, Duration::from_millis(500)).unwrap();

        let err = queue.acknowledge(first.remove(0)).unwrap_err();
        assert!(matches!(err, QueueError::StaleReceipt { .. }));

        queue.acknowledge(second.remove(0)).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn blocked_poll_wakes_up_on_send() {
        let queue = std::sync::Arc::new(InMemoryOrderQueue::default());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.send("late").unwrap();
        });

        let batch = queue.poll(10, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body(), "late");
    }

    #[test]
    fn exhausted_message_is_dead_lettered() {
        let queue = InMemoryOrderQueue::new(Duration::from_millis(5)).with_max_receive_count(2);
        let id = queue.send("poison").unwrap();

        for _ in 0..2 {
            let batch = queue.poll(1, Duration::from_millis(200)).unwrap();
            assert_eq!(batch.len(), 1);
        }

        let batch = queue.poll(1, Duration::from_millis(50)).unwrap();
        assert!(batch.is_empty());

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].receive_count, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn in_flight_counts_hidden_messages() {
        let queue = InMemoryOrderQueue::default();
        queue.send("a").unwrap();
        queue.send("b").unwrap();

        let _batch = queue.poll(1, NO_WAIT).unwrap();
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.len(), 2);
    }
}
