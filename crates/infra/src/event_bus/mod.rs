//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `stockflow-events` as pure mechanics. This module
//! provides the Redis-backed outbound stream for stock updates.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsEventBus;
