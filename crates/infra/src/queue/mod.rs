//! Infrastructure-backed [`OrderQueue`](stockflow_events::OrderQueue) implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsOrderQueue;
