//! Infrastructure layer: settlement pipeline, durable backends, configuration.

pub mod config;
pub mod event_bus;
pub mod ledger;
pub mod queue;
pub mod settlement;
#[cfg(feature = "redis")]
pub mod streams;
pub mod workers;


pub use config::{Backend, ConfigError, LedgerBackend, SettlementConfig};
pub use ledger::PostgresStockLedger;
pub use settlement::{OutcomePublisher, PublishError, SettlementWorker, TRACEPARENT_ATTRIBUTE};
#[cfg(feature = "redis")]
pub use streams::RedisStreamsError;
pub use workers::{
    CycleOutcome, LoopStats, SettlementLoop, SettlementLoopConfig, SettlementLoopHandle,
};
