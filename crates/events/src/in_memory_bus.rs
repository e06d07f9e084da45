//! In-memory event bus for tests/dev.

use std::collections::VecDeque;
use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus state poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out to every live subscription
/// - Keeps the most recent published messages for inspection (`published()`), up to
///   the history limit
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
    published: Mutex<VecDeque<M>>,
    history_limit: usize,
}

/// Messages retained by `published()` unless overridden.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `limit` messages; `0` keeps no history.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    /// The retained messages, oldest first.
    pub fn published(&self) -> Vec<M> {
        self.published
            .lock()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        drop(subs);

        if self.history_limit == 0 {
            return Ok(());
        }
        let mut published = self.published.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        if published.len() == self.history_limit {
            published.pop_front();
        }
        published.push_back(message);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
