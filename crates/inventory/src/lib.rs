//! Inventory settlement domain.
//!
//! This crate contains the business rules for reserving stock against an order:
//! the conditional-decrement ledger contract, order payload parsing and the
//! settlement outcome model. Storage backends implement [`StockLedger`]; the
//! in-memory ledger here is the reference implementation.

pub mod ledger;
pub mod order;
pub mod outcome;

pub use ledger::{
    DecrementError, InMemoryStockLedger, LedgerError, StockLedger, StockRecord, validate_decrement,
};
pub use order::{DEFAULT_QUANTITY, OrderEvent, OrderMetadata, PayloadError, PayloadPolicy};
pub use outcome::{FailureReason, STOCK_UPDATE_SOURCE, SettlementOutcome, StockUpdated};
