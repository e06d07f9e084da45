//! Outcome publisher: forwards successful decrements to the downstream bus.
//!
//! Only `Decremented` outcomes are forwarded (as [`StockUpdated`]); every other outcome
//! is a no-op here and is reported through logs instead.
//!
//! A publish failure happens after the decrement is already durable. It is returned to
//! the caller for logging/metrics and is never retried in-line: re-running the whole
//! settlement would decrement a second time.

use thiserror::Error;
use tracing::{debug, instrument};

use stockflow_core::Sku;
use stockflow_events::EventBus;
use stockflow_inventory::{SettlementOutcome, StockUpdated};

#[derive(Debug, Error)]
pub enum PublishError {
    /// The bus rejected the event. The ledger has already been decremented.
    #[error("failed to publish stock update for {sku} (stock {stock}): {reason}")]
    Bus { sku: Sku, stock: u64, reason: String },
}

#[derive(Debug)]
pub struct OutcomePublisher<B> {
    bus: B,
}

impl<B> OutcomePublisher<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> OutcomePublisher<B>
where
    B: EventBus<StockUpdated>,
{
    /// Publish the downstream event for `outcome`, if it has one.
    #[instrument(skip(self, outcome), fields(outcome = outcome.label()))]
    pub fn publish(&self, outcome: &SettlementOutcome) -> Result<(), PublishError> {
        let Some(event) = StockUpdated::from_outcome(outcome) else {
            debug!("outcome is not forwarded downstream");
            return Ok(());
        };

        let (sku, stock) = (event.sku.clone(), event.stock);
        self.bus.publish(event).map_err(|e| PublishError::Bus {
            sku,
            stock,
            reason: e.to_string(),
        })
    }
}
