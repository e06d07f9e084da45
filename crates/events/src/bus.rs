//! Outbound event publishing/subscription abstraction (mechanics only).
//!
//! The settlement pipeline uses a bus to forward outcome events (e.g. stock-level
//! updates) to downstream consumers such as pricing. The bus is the **outbound side**;
//! the inbound side is the acknowledged work queue in [`crate::queue`].
//!
//! ## Delivery Guarantees
//!
//! - **Transport-agnostic**: in-memory channels, Redis Streams, message queues, etc.
//! - **At-least-once** from the consumer's perspective; consumers must tolerate duplicates
//! - **No ordering guarantees** across publishers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an outbound event stream.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => reprice(event)?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    open: Arc<AtomicBool>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag cleared when this subscription is dropped.
    ///
    /// Producers that can go a long time without sending (e.g. a thread tailing an idle
    /// stream) check it to stop without waiting for a failed send.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// `publish()` can fail (bus unreachable, serialization). Callers decide what a failure
/// means; for the settlement pipeline a publish failure happens *after* a durable stock
/// decrement and is therefore reported, never retried in-line.
///
/// The trait requires `Send + Sync`; multiple threads may publish concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn open_flag_clears_when_subscription_is_dropped() {
        let (_tx, rx) = mpsc::channel::<u32>();
        let subscription = Subscription::new(rx);
        let open = subscription.open_flag();
        assert!(open.load(Ordering::Acquire));

        drop(subscription);
        assert!(!open.load(Ordering::Acquire));
    }
}
