//! Settlement loop (supervisor): queue → worker → publisher → acknowledge.
//!
//! ```text
//! Running ──poll──▶ batch ──for each message──▶ settle ──▶ publish? ──▶ ack?
//!    ▲                │ empty: re-poll immediately                       │
//!    │                ▼                                                  │
//!    └──── backoff ◀── systemic error (queue down, ledger unreachable) ◀─┘
//! ```
//!
//! - Empty polls are normal and re-poll without delay.
//! - A panic while settling one message is caught and logged; the message is left for
//!   redelivery and the loop keeps going.
//! - Systemic errors stop the current batch (remaining messages are redelivered) and
//!   pause for a fixed backoff. The pause is interrupted by shutdown.
//! - Shutdown is cooperative: checked between polls, between messages and while backing
//!   off. A poll already blocking finishes its long-poll wait first.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, info_span, warn};

use stockflow_events::{EventBus, InFlightMessage, MAX_BATCH_SIZE, OrderQueue, clamp_batch_size};
use stockflow_inventory::{SettlementOutcome, StockLedger, StockUpdated};

use crate::settlement::{OutcomePublisher, SettlementWorker, TRACEPARENT_ATTRIBUTE};

/// Settlement loop configuration.
#[derive(Debug, Clone)]
pub struct SettlementLoopConfig {
    /// Name for logging and the worker thread.
    pub name: String,
    /// Messages requested per poll (clamped to `1..=10`).
    pub batch_size: usize,
    /// Long-poll wait per poll.
    pub poll_wait: Duration,
    /// Fixed pause after a systemic error.
    pub backoff: Duration,
}

impl Default for SettlementLoopConfig {
    fn default() -> Self {
        Self {
            name: "settlement-loop".to_string(),
            batch_size: MAX_BATCH_SIZE,
            poll_wait: Duration::from_secs(20),
            backoff: Duration::from_secs(5),
        }
    }
}

impl SettlementLoopConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = clamp_batch_size(batch_size);
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Loop runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub polls: u64,
    pub empty_polls: u64,
    pub messages_received: u64,
    pub decremented: u64,
    pub insufficient_stock: u64,
    pub transient_failures: u64,
    /// Decrements that are durable but whose downstream event was not published.
    pub publish_failures: u64,
    pub acknowledge_failures: u64,
    pub panics: u64,
    pub backoffs: u64,
    pub uptime_secs: u64,
}

/// What one poll cycle amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The poll returned no messages.
    Idle,
    /// A batch was handled; `messages` counts those that reached a disposition.
    Processed { messages: usize },
    /// A systemic error cut the cycle short; the caller should back off.
    Systemic { reason: String },
    /// Shutdown was requested mid-batch.
    Stopped,
}

/// What happened to one message.
#[derive(Debug)]
enum Disposition {
    Acknowledged,
    /// Left un-acknowledged; the visibility window will redeliver it.
    Abandoned,
    Systemic(String),
}

/// Handle to control a running settlement loop.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also stops the loop,
/// but does not wait for it.
#[derive(Debug)]
pub struct SettlementLoopHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<LoopStats>>,
}

impl SettlementLoopHandle {
    /// Request graceful shutdown, wait for the loop thread to finish and return the
    /// final statistics.
    pub fn shutdown(mut self) -> LoopStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("settlement loop thread panicked");
            }
        }
        snapshot(&self.stats)
    }

    /// Current loop statistics.
    pub fn stats(&self) -> LoopStats {
        snapshot(&self.stats)
    }
}

/// Drives the settlement pipeline.
pub struct SettlementLoop<Q, L, B> {
    queue: Q,
    worker: SettlementWorker<L>,
    publisher: OutcomePublisher<B>,
    config: SettlementLoopConfig,
    stats: Arc<Mutex<LoopStats>>,
}

impl<Q, L, B> SettlementLoop<Q, L, B>
where
    Q: OrderQueue,
    L: StockLedger,
    B: EventBus<StockUpdated>,
{
    pub fn new(
        queue: Q,
        worker: SettlementWorker<L>,
        publisher: OutcomePublisher<B>,
        config: SettlementLoopConfig,
    ) -> Self {
        Self {
            queue,
            worker,
            publisher,
            config,
            stats: Arc::new(Mutex::new(LoopStats::default())),
        }
    }

    pub fn config(&self) -> &SettlementLoopConfig {
        &self.config
    }

    pub fn stats(&self) -> LoopStats {
        snapshot(&self.stats)
    }

    /// Run a single poll cycle on the calling thread (no backoff sleep).
    pub fn run_once(&self) -> CycleOutcome {
        self.cycle(&|| false)
    }

    /// Spawn the loop on a dedicated, named thread.
    pub fn spawn(self) -> SettlementLoopHandle
    where
        Q: 'static,
        L: 'static,
        B: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.run(ShutdownSignal::new(shutdown_rx)))
            .expect("failed to spawn settlement loop thread");

        SettlementLoopHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    fn run(self, signal: ShutdownSignal) {
        info!(
            worker = %self.config.name,
            batch_size = self.config.batch_size,
            poll_wait_ms = self.config.poll_wait.as_millis() as u64,
            backoff_ms = self.config.backoff.as_millis() as u64,
            "settlement loop started"
        );
        let started = Instant::now();

        while !signal.is_set() {
            self.record(|s| s.uptime_secs = started.elapsed().as_secs());

            match self.cycle(&|| signal.is_set()) {
                CycleOutcome::Idle | CycleOutcome::Processed { .. } => {}
                CycleOutcome::Stopped => break,
                CycleOutcome::Systemic { reason } => {
                    warn!(
                        worker = %self.config.name,
                        reason = %reason,
                        backoff_ms = self.config.backoff.as_millis() as u64,
                        "systemic failure; backing off"
                    );
                    self.record(|s| s.backoffs += 1);
                    if signal.wait(self.config.backoff) {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.config.name, "settlement loop stopped");
    }

    fn cycle(&self, should_stop: &dyn Fn() -> bool) -> CycleOutcome {
        let batch = match self
            .queue
            .poll(self.config.batch_size, self.config.poll_wait)
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "failed to poll order queue");
                self.record(|s| s.polls += 1);
                return CycleOutcome::Systemic {
                    reason: e.to_string(),
                };
            }
        };

        let received = batch.len() as u64;
        self.record(|s| {
            s.polls += 1;
            s.messages_received += received;
            if received == 0 {
                s.empty_polls += 1;
            }
        });

        if batch.is_empty() {
            return CycleOutcome::Idle;
        }

        let mut handled = 0;
        for message in batch {
            if should_stop() {
                return CycleOutcome::Stopped;
            }
            match self.handle_message(message) {
                Disposition::Acknowledged | Disposition::Abandoned => handled += 1,
                Disposition::Systemic(reason) => return CycleOutcome::Systemic { reason },
            }
        }

        CycleOutcome::Processed { messages: handled }
    }

    fn handle_message(&self, message: InFlightMessage) -> Disposition {
        let span = info_span!(
            "settle_message",
            worker = %self.config.name,
            message_id = %message.message_id(),
            receive_count = message.receive_count(),
            traceparent = message.attribute(TRACEPARENT_ATTRIBUTE).unwrap_or("")
        );
        let _guard = span.enter();

        let settled =
            panic::catch_unwind(AssertUnwindSafe(|| self.worker.settle_message(&message)));
        let outcome = match settled {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("settlement panicked; message left for redelivery");
                self.record(|s| s.panics += 1);
                return Disposition::Abandoned;
            }
        };

        self.record(|s| match &outcome {
            SettlementOutcome::Decremented { .. } => s.decremented += 1,
            SettlementOutcome::InsufficientStock { .. } => s.insufficient_stock += 1,
            SettlementOutcome::TransientFailure { .. } => s.transient_failures += 1,
        });

        if let Err(e) = self.publisher.publish(&outcome) {
            // Partial failure: the decrement is durable and must not be repeated.
            error!(error = %e, "stock decremented but downstream event was not published");
            self.record(|s| s.publish_failures += 1);
        }

        if !outcome.should_acknowledge() {
            if let SettlementOutcome::TransientFailure { reason } = &outcome {
                if reason.is_systemic() {
                    return Disposition::Systemic(reason.to_string());
                }
            }
            return Disposition::Abandoned;
        }

        match self.queue.acknowledge(message) {
            Ok(()) => Disposition::Acknowledged,
            Err(e) => {
                self.record(|s| s.acknowledge_failures += 1);
                if e.is_systemic() {
                    error!(error = %e, "failed to acknowledge message");
                    Disposition::Systemic(e.to_string())
                } else {
                    warn!(error = %e, "acknowledgment rejected; message may be settled again");
                    Disposition::Abandoned
                }
            }
        }
    }

    fn record(&self, f: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }
}

fn snapshot(stats: &Mutex<LoopStats>) -> LoopStats {
    stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
}

/// Latching view over the shutdown channel.
///
/// A dropped sender counts as a shutdown request.
struct ShutdownSignal {
    rx: mpsc::Receiver<()>,
    fired: Cell<bool>,
}

impl ShutdownSignal {
    fn new(rx: mpsc::Receiver<()>) -> Self {
        Self {
            rx,
            fired: Cell::new(false),
        }
    }

    fn is_set(&self) -> bool {
        if self.fired.get() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                self.fired.set(true);
                true
            }
            Err(mpsc::TryRecvError::Empty) => false,
        }
    }

    /// Sleep for up to `timeout`; returns `true` if shutdown was requested meanwhile.
    fn wait(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.fired.set(true);
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use stockflow_core::Sku;
    use stockflow_events::{InMemoryEventBus, InMemoryOrderQueue, QueueError};
    use stockflow_inventory::{DecrementError, InMemoryStockLedger, LedgerError, PayloadPolicy};

    use super::*;

    type Bus = Arc<InMemoryEventBus<StockUpdated>>;

    fn sku(raw: &str) -> Sku {
        Sku::parse(raw).unwrap()
    }

    fn fast_config() -> SettlementLoopConfig {
        SettlementLoopConfig::default()
            .with_name("test-loop")
            .with_poll_wait(Duration::from_millis(10))
            .with_backoff(Duration::from_millis(20))
    }

    fn build<Q: OrderQueue, L: StockLedger>(
        queue: Q,
        ledger: L,
    ) -> (SettlementLoop<Q, L, Bus>, Bus) {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let lp = SettlementLoop::new(
            queue,
            SettlementWorker::new(ledger, PayloadPolicy::strict()),
            OutcomePublisher::new(bus.clone()),
            fast_config(),
        );
        (lp, bus)
    }

    /// Queue whose polls fail until `failures` is exhausted.
    struct FlakyQueue {
        inner: InMemoryOrderQueue,
        failures: AtomicU32,
    }

    impl OrderQueue for FlakyQueue {
        fn poll(&self, max: usize, wait: Duration) -> Result<Vec<InFlightMessage>, QueueError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QueueError::Unavailable("connection refused".into()));
            }
            self.inner.poll(max, wait)
        }

        fn acknowledge(&self, message: InFlightMessage) -> Result<(), QueueError> {
            self.inner.acknowledge(message)
        }
    }

    /// Ledger that panics on a specific SKU.
    struct PanickyLedger(InMemoryStockLedger);

    impl StockLedger for PanickyLedger {
        fn decrement(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError> {
            if sku.as_str() == "BOOM" {
                panic!("ledger bug");
            }
            self.0.decrement(sku, quantity)
        }

        fn quantity(&self, sku: &Sku) -> Result<Option<u64>, LedgerError> {
            self.0.quantity(sku)
        }
    }

    /// Ledger that is unreachable.
    struct DownLedger;

    impl StockLedger for DownLedger {
        fn decrement(&self, _sku: &Sku, _quantity: u32) -> Result<u64, DecrementError> {
            Err(LedgerError::Unavailable("connection refused".into()).into())
        }

        fn quantity(&self, _sku: &Sku) -> Result<Option<u64>, LedgerError> {
            Err(LedgerError::Unavailable("connection refused".into()))
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn empty_poll_is_idle_and_not_a_backoff() {
        let queue = Arc::new(InMemoryOrderQueue::default());
        let (lp, _bus) = build(queue, InMemoryStockLedger::new());

        assert_eq!(lp.run_once(), CycleOutcome::Idle);
        let stats = lp.stats();
        assert_eq!(stats.empty_polls, 1);
        assert_eq!(stats.backoffs, 0);
    }

    #[test]
    fn processes_batch_and_acknowledges_business_outcomes() {
        let queue = Arc::new(InMemoryOrderQueue::default());
        queue.send(r#"{"sku":"ABC","quantity":3}"#).unwrap();
        queue.send(r#"{"sku":"ABC","quantity":50}"#).unwrap();
        let ledger = InMemoryStockLedger::with_stock([(sku("ABC"), 10)]);
        let (lp, bus) = build(queue.clone(), ledger);

        assert_eq!(lp.run_once(), CycleOutcome::Processed { messages: 2 });
        assert!(queue.is_empty());
        assert_eq!(bus.published(), vec![StockUpdated::new(sku("ABC"), 7)]);

        let stats = lp.stats();
        assert_eq!(stats.decremented, 1);
        assert_eq!(stats.insufficient_stock, 1);
    }

    #[test]
    fn malformed_message_is_left_unacknowledged() {
        let queue = Arc::new(InMemoryOrderQueue::default());
        queue.send("{not json").unwrap();
        let (lp, bus) = build(queue.clone(), InMemoryStockLedger::new());

        assert_eq!(lp.run_once(), CycleOutcome::Processed { messages: 1 });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 1);
        assert!(bus.published().is_empty());
        assert_eq!(lp.stats().transient_failures, 1);
    }

    #[test]
    fn unreachable_ledger_stops_batch_and_requests_backoff() {
        let queue = Arc::new(InMemoryOrderQueue::default());
        queue.send(r#"{"sku":"ABC","quantity":1}"#).unwrap();
        queue.send(r#"{"sku":"ABC","quantity":1}"#).unwrap();
        let (lp, _bus) = build(queue.clone(), DownLedger);

        assert!(matches!(lp.run_once(), CycleOutcome::Systemic { .. }));
        assert_eq!(queue.len(), 2);
        assert_eq!(lp.stats().transient_failures, 1);
    }

    #[test]
    fn panic_in_one_message_does_not_stop_the_batch() {
        let queue = Arc::new(InMemoryOrderQueue::default());
        queue.send(r#"{"sku":"BOOM","quantity":1}"#).unwrap();
        queue.send(r#"{"sku":"ABC","quantity":1}"#).unwrap();
        let ledger = PanickyLedger(InMemoryStockLedger::with_stock([(sku("ABC"), 5)]));
        let (lp, bus) = build(queue.clone(), ledger);

        assert_eq!(lp.run_once(), CycleOutcome::Processed { messages: 2 });
        assert_eq!(lp.stats().panics, 1);
        assert_eq!(bus.published(), vec![StockUpdated::new(sku("ABC"), 4)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn spawned_loop_backs_off_then_recovers() {
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryOrderQueue::default(),
            failures: AtomicU32::new(2),
        });
        queue.inner.send(r#"{"sku":"ABC","quantity":2}"#).unwrap();
        let ledger = InMemoryStockLedger::with_stock([(sku("ABC"), 5)]);
        let (lp, bus) = build(queue.clone(), ledger);

        let handle = lp.spawn();
        let done = wait_until(Duration::from_secs(5), || {
            handle.stats().decremented == 1 && queue.inner.is_empty()
        });
        let stats = handle.stats();
        handle.shutdown();

        assert!(done);
        assert_eq!(stats.backoffs, 2);
        assert_eq!(bus.published(), vec![StockUpdated::new(sku("ABC"), 3)]);
    }

    #[test]
    fn shutdown_interrupts_a_long_backoff() {
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryOrderQueue::default(),
            failures: AtomicU32::new(u32::MAX),
        });
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let lp = SettlementLoop::new(
            queue,
            SettlementWorker::new(InMemoryStockLedger::new(), PayloadPolicy::strict()),
            OutcomePublisher::new(bus),
            fast_config().with_backoff(Duration::from_secs(60)),
        );

        let handle = lp.spawn();
        assert!(wait_until(Duration::from_secs(5), || handle.stats().backoffs == 1));

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
