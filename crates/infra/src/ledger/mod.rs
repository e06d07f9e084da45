//! Durable [`StockLedger`](stockflow_inventory::StockLedger) implementations.
//!
//! The in-memory ledger lives in `stockflow-inventory`; this module adds the backends
//! that survive a restart.

pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_hash;

pub use postgres::PostgresStockLedger;
#[cfg(feature = "redis")]
pub use redis_hash::RedisStockLedger;
