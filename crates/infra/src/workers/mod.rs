//! Long-running background workers.

pub mod settlement_loop;

pub use settlement_loop::{
    CycleOutcome, LoopStats, SettlementLoop, SettlementLoopConfig, SettlementLoopHandle,
};
