//! Settlement outcomes and the outbound stock-update event.

use serde::{Deserialize, Serialize};

use stockflow_core::Sku;

use crate::ledger::{DecrementError, LedgerError};
use crate::order::PayloadError;

/// `source` value stamped on every outbound stock update.
pub const STOCK_UPDATE_SOURCE: &str = "inventory-processor";

/// Why a settlement attempt did not reach a business decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The payload could not be turned into an order.
    Malformed(String),
    /// The ledger could not be reached; affects every message.
    LedgerUnavailable(String),
    /// Any other ledger failure.
    Ledger(String),
}

impl FailureReason {
    pub fn is_systemic(&self) -> bool {
        matches!(self, FailureReason::LedgerUnavailable(_))
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FailureReason::Malformed(msg) => write!(f, "malformed order: {msg}"),
            FailureReason::LedgerUnavailable(msg) => write!(f, "ledger unavailable: {msg}"),
            FailureReason::Ledger(msg) => write!(f, "ledger error: {msg}"),
        }
    }
}

impl From<PayloadError> for FailureReason {
    fn from(value: PayloadError) -> Self {
        FailureReason::Malformed(value.to_string())
    }
}

impl From<LedgerError> for FailureReason {
    fn from(value: LedgerError) -> Self {
        if value.is_systemic() {
            FailureReason::LedgerUnavailable(value.to_string())
        } else {
            FailureReason::Ledger(value.to_string())
        }
    }
}

/// Result of settling one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Stock was reserved; `new_quantity` is what is left.
    Decremented { sku: Sku, new_quantity: u64 },
    /// Not enough stock (or unknown SKU). A final business answer.
    InsufficientStock { sku: Sku },
    /// No decision was reached; the message should be redelivered.
    TransientFailure { reason: FailureReason },
}

impl SettlementOutcome {
    /// Map a ledger result for `sku` onto an outcome.
    pub fn from_decrement(sku: &Sku, result: Result<u64, DecrementError>) -> Self {
        match result {
            Ok(new_quantity) => SettlementOutcome::Decremented {
                sku: sku.clone(),
                new_quantity,
            },
            Err(DecrementError::InsufficientStock { sku, .. }) => {
                SettlementOutcome::InsufficientStock { sku }
            }
            Err(DecrementError::Ledger(err)) => SettlementOutcome::TransientFailure {
                reason: err.into(),
            },
        }
    }

    /// Business outcomes are final and consume the message; transient failures do not.
    pub fn should_acknowledge(&self) -> bool {
        !matches!(self, SettlementOutcome::TransientFailure { .. })
    }

    pub fn is_systemic_failure(&self) -> bool {
        matches!(self, SettlementOutcome::TransientFailure { reason } if reason.is_systemic())
    }

    pub fn label(&self) -> &'static str {
        match self {
            SettlementOutcome::Decremented { .. } => "decremented",
            SettlementOutcome::InsufficientStock { .. } => "insufficient_stock",
            SettlementOutcome::TransientFailure { .. } => "transient_failure",
        }
    }
}

/// Outbound event emitted after a successful decrement.
///
/// Serialized as `{"sku": "...", "stock": 7, "source": "inventory-processor"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockUpdated {
    pub sku: Sku,
    pub stock: u64,
    pub source: String,
}

impl StockUpdated {
    pub fn new(sku: Sku, stock: u64) -> Self {
        Self {
            sku,
            stock,
            source: STOCK_UPDATE_SOURCE.to_string(),
        }
    }

    /// The event for an outcome, if the outcome is one that gets forwarded.
    pub fn from_outcome(outcome: &SettlementOutcome) -> Option<Self> {
        match outcome {
            SettlementOutcome::Decremented { sku, new_quantity } => {
                Some(Self::new(sku.clone(), *new_quantity))
            }
            _ => None,
        }
    }
}
