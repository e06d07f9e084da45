//! Settlement application layer: the per-message worker and the outcome publisher.

pub mod publisher;
pub mod worker;

pub use publisher::{OutcomePublisher, PublishError};
pub use worker::{SettlementWorker, TRACEPARENT_ATTRIBUTE};
