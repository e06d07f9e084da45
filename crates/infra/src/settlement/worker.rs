//! Per-message settlement: parse → validate → conditional decrement → outcome.
//!
//! ```text
//! InFlightMessage
//!   ↓
//! 1. Parse payload under the configured PayloadPolicy (reject, never patch)
//!   ↓
//! 2. StockLedger::decrement(sku, quantity)   (exactly one call)
//!   ↓
//! 3. Map ledger result → SettlementOutcome
//! ```
//!
//! The worker never acknowledges or publishes; the settlement loop acts on the outcome.
//!
//! ## Redelivery
//!
//! There is no deduplication. A redelivered message is settled again, and a second
//! successful decrement is applied. That is the accepted at-least-once trade-off; an
//! order-id "processed" set with insert-if-absent semantics would be needed for
//! exactly-once settlement.

use tracing::{error, info, instrument, warn};

use stockflow_events::InFlightMessage;
use stockflow_inventory::{OrderEvent, PayloadError, PayloadPolicy, SettlementOutcome, StockLedger};

/// Message attribute carrying the producer's W3C trace context.
pub const TRACEPARENT_ATTRIBUTE: &str = "traceparent";

/// Settles order events against a [`StockLedger`].
#[derive(Debug)]
pub struct SettlementWorker<L> {
    ledger: L,
    policy: PayloadPolicy,
}

impl<L> SettlementWorker<L> {
    pub fn new(ledger: L, policy: PayloadPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn policy(&self) -> PayloadPolicy {
        self.policy
    }

    /// Parse a queue message into an order, attaching the propagated trace context.
    pub fn parse(&self, message: &InFlightMessage) -> Result<OrderEvent, PayloadError> {
        let order = OrderEvent::parse(message.body(), self.policy)?;
        let trace_parent = message.attribute(TRACEPARENT_ATTRIBUTE).map(str::to_string);
        Ok(order.with_trace_parent(trace_parent))
    }
}

impl<L> SettlementWorker<L>
where
    L: StockLedger,
{
    /// Parse and settle a raw queue message.
    ///
    /// Malformed payloads become `TransientFailure(Malformed)` without touching the ledger.
    pub fn settle_message(&self, message: &InFlightMessage) -> SettlementOutcome {
        match self.parse(message) {
            Ok(order) => self.settle(&order),
            Err(err) => {
                warn!(
                    message_id = %message.message_id(),
                    receive_count = message.receive_count(),
                    error = %err,
                    "rejecting malformed order payload"
                );
                SettlementOutcome::TransientFailure { reason: err.into() }
            }
        }
    }

    /// Settle one order with a single conditional decrement.
    #[instrument(
        skip(self, order),
        fields(
            sku = %order.sku(),
            quantity = order.quantity(),
            order_id = order.metadata().order_id.as_deref().unwrap_or(""),
            traceparent = order.metadata().trace_parent.as_deref().unwrap_or("")
        )
    )]
    pub fn settle(&self, order: &OrderEvent) -> SettlementOutcome {
        let result = self.ledger.decrement(order.sku(), order.quantity());
        let outcome = SettlementOutcome::from_decrement(order.sku(), result);

        match &outcome {
            SettlementOutcome::Decremented { new_quantity, .. } => {
                info!(new_quantity = *new_quantity, "stock decremented");
            }
            SettlementOutcome::InsufficientStock { .. } => {
                warn!("insufficient stock; order will not be fulfilled");
            }
            SettlementOutcome::TransientFailure { reason } => {
                error!(
                    reason = %reason,
                    systemic = reason.is_systemic(),
                    "stock ledger call failed"
                );
            }
        }

        outcome
    }
}
