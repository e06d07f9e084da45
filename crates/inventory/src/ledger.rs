//! Stock ledger: per-SKU available quantity with an atomic conditional decrement.
//!
//! ## Contract
//!
//! `decrement(sku, quantity)` checks `current >= quantity` and writes
//! `current - quantity` as **one indivisible step** with respect to every other
//! decrement on the same SKU. Implementations get there differently (a mutex here,
//! a conditional `UPDATE ... WHERE quantity >= $2` in Postgres, a server-side script
//! in Redis) but the observable behaviour is identical:
//!
//! - success returns the post-decrement quantity (never negative)
//! - a failed precondition returns [`DecrementError::InsufficientStock`] and mutates nothing
//! - an unknown SKU behaves like a record with quantity `0`
//! - infrastructure failures are reported as [`DecrementError::Ledger`] and are never
//!   confused with insufficient stock
//!
//! The ledger is the only writer of stock during settlement, so concurrent settlements
//! on the same SKU need no external locking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::Sku;

/// Current stock for one SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub sku: Sku,
    pub quantity: u64,
    /// Number of successful mutations applied to this record.
    pub version: u64,
}

impl StockRecord {
    pub fn new(sku: Sku, quantity: u64) -> Self {
        Self {
            sku,
            quantity,
            version: 0,
        }
    }

    /// Apply a conditional decrement in place.
    ///
    /// Returns the new quantity, or `None` (leaving the record untouched) when the
    /// available quantity is lower than `requested`.
    pub fn try_decrement(&mut self, requested: u32) -> Option<u64> {
        let remaining = self.quantity.checked_sub(u64::from(requested))?;
        self.quantity = remaining;
        self.version += 1;
        Some(remaining)
    }
}

/// Infrastructure-level ledger failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The backing store could not be reached (connection refused, pool timeout, ...).
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The request violated the ledger's input contract.
    #[error("invalid ledger request: {0}")]
    InvalidRequest(String),

    /// The backend failed the operation for a non-connectivity reason.
    #[error("ledger backend error: {0}")]
    Backend(String),

    /// A stored value could not be interpreted as a stock quantity.
    #[error("corrupt stock record for {sku}: {detail}")]
    Corrupt { sku: Sku, detail: String },
}

impl LedgerError {
    /// Connectivity problems affect every message, not just the current one.
    pub fn is_systemic(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Outcome of a decrement that did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecrementError {
    /// Business outcome: `current < requested` (or the SKU is unknown). Not retryable.
    #[error("insufficient stock for {sku} (requested {requested})")]
    InsufficientStock { sku: Sku, requested: u32 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Keyed stock store exposing the atomic conditional decrement.
pub trait StockLedger: Send + Sync {
    /// Atomically decrement `sku` by `quantity` if enough stock is available.
    fn decrement(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError>;

    /// Read the current quantity (`None` for an unknown SKU).
    fn quantity(&self, sku: &Sku) -> Result<Option<u64>, LedgerError>;
}

impl<L> StockLedger for Arc<L>
where
    L: StockLedger + ?Sized,
{
    fn decrement(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError> {
        (**self).decrement(sku, quantity)
    }

    fn quantity(&self, sku: &Sku) -> Result<Option<u64>, LedgerError> {
        (**self).quantity(sku)
    }
}

/// Shared input check for every ledger implementation.
pub fn validate_decrement(quantity: u32) -> Result<(), LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidRequest(
            "decrement quantity must be positive".to_string(),
        ));
    }
    Ok(())
}

/// In-memory ledger (tests/dev).
///
/// A single mutex guards the whole map, so check-and-write is trivially atomic.
/// Seed it with [`InMemoryStockLedger::with_stock`] or [`InMemoryStockLedger::set_quantity`];
/// both are provisioning helpers, not part of the settlement path.
#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    records: Mutex<HashMap<Sku, StockRecord>>,
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock(stock: impl IntoIterator<Item = (Sku, u64)>) -> Self {
        let records = stock
            .into_iter()
            .map(|(sku, qty)| (sku.clone(), StockRecord::new(sku, qty)))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    /// Overwrite (or create) a record. Provisioning only.
    pub fn set_quantity(&self, sku: Sku, quantity: u64) -> Result<(), LedgerError> {
        let mut records = self.lock()?;
        records.insert(sku.clone(), StockRecord::new(sku, quantity));
        Ok(())
    }

    pub fn record(&self, sku: &Sku) -> Result<Option<StockRecord>, LedgerError> {
        Ok(self.lock()?.get(sku).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Sku, StockRecord>>, LedgerError> {
        self.records
            .lock()
            .map_err(|_| LedgerError::Backend("ledger lock poisoned".to_string()))
    }
}

impl StockLedger for InMemoryStockLedger {
    fn decrement(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError> {
        validate_decrement(quantity)?;

        let mut records = self.lock()?;
        let insufficient = || DecrementError::InsufficientStock {
            sku: sku.clone(),
            requested: quantity,
        };

        let record = records.get_mut(sku).ok_or_else(insufficient)?;
        record.try_decrement(quantity).ok_or_else(insufficient)
    }

    fn quantity(&self, sku: &Sku) -> Result<Option<u64>, LedgerError> {
        Ok(self.lock()?.get(sku).map(|r| r.quantity))
    }
}
