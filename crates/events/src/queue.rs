//! Durable work-queue abstraction (receive / acknowledge mechanics only).
//!
//! This module models the **inbound side** of the pipeline: a queue that hands out
//! batches of pending messages and removes a message only when it is acknowledged.
//!
//! ## Delivery Model
//!
//! - **Long-poll**: `poll()` blocks for up to `wait` and returns an empty batch on timeout
//! - **At-least-once**: a received message is hidden for a visibility window; if it is
//!   not acknowledged in time it becomes visible again (to any consumer)
//! - **Acknowledge = done**: there is no explicit retry command; not acknowledging is the
//!   only way to request redelivery
//!
//! ## Ownership
//!
//! [`InFlightMessage`] is deliberately not `Clone`. `acknowledge()` consumes it, so a
//! message can be released at most once per receive. Dropping it abandons the attempt
//! and leaves redelivery to the visibility window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Upper bound for messages returned by a single poll.
pub const MAX_BATCH_SIZE: usize = 10;

/// Opaque receipt identifying one receive of a message.
///
/// A new token is issued on every (re)delivery; only the latest one acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AckToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received-but-not-yet-acknowledged message.
#[derive(Debug)]
pub struct InFlightMessage {
    message_id: String,
    receipt: AckToken,
    body: String,
    attributes: BTreeMap<String, String>,
    receive_count: u32,
    received_at: DateTime<Utc>,
}

impl InFlightMessage {
    pub fn new(
        message_id: impl Into<String>,
        receipt: AckToken,
        body: impl Into<String>,
        attributes: BTreeMap<String, String>,
        receive_count: u32,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt,
            body: body.into(),
            attributes,
            receive_count,
            received_at: Utc::now(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn receipt(&self) -> &AckToken {
        &self.receipt
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// String attributes delivered alongside the body (e.g. `traceparent`).
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// How many times this message has been handed out, including this receive.
    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// A message moved aside after exceeding the queue's receive limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    pub receive_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Queue operation error.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue backend could not be reached.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed a command.
    #[error("queue command failed: {0}")]
    Command(String),

    /// The receipt is no longer current (visibility expired and the message was redelivered).
    #[error("stale receipt for message {message_id}")]
    StaleReceipt { message_id: String },

    /// Internal lock poisoning (in-process queues).
    #[error("queue state poisoned")]
    Poisoned,
}

impl QueueError {
    /// Whether the error indicates the queue itself is unhealthy (as opposed to a
    /// problem with one particular message).
    pub fn is_systemic(&self) -> bool {
        !matches!(self, QueueError::StaleReceipt { .. })
    }
}

/// Inbound order queue.
///
/// ## Thread Safety
///
/// Implementations are `Send + Sync`; a single settlement loop owns the polling, but the
/// same queue value may be shared with producers (tests, dev wiring).
pub trait OrderQueue: Send + Sync {
    /// Receive up to `max_messages` (clamped to [`MAX_BATCH_SIZE`]) messages, blocking up
    /// to `wait` when none are immediately available.
    fn poll(&self, max_messages: usize, wait: Duration) -> Result<Vec<InFlightMessage>, QueueError>;

    /// Mark a message as fully handled and remove it from the queue.
    fn acknowledge(&self, message: InFlightMessage) -> Result<(), QueueError>;
}

impl<Q> OrderQueue for Arc<Q>
where
    Q: OrderQueue + ?Sized,
{
    fn poll(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<InFlightMessage>, QueueError> {
        (**self).poll(max_messages, wait)
    }

    fn acknowledge(&self, message: InFlightMessage) -> Result<(), QueueError> {
        (**self).acknowledge(message)
    }
}

/// Clamp a requested batch size to `1..=MAX_BATCH_SIZE`.
pub fn clamp_batch_size(requested: usize) -> usize {
    requested.clamp(1, MAX_BATCH_SIZE)
}
