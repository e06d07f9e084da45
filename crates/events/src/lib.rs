//! `stockflow-events`: message transport mechanics.
//!
//! - [`queue`]: inbound, acknowledged work queue (`OrderQueue`, `InFlightMessage`)
//! - [`bus`]: outbound pub/sub (`EventBus`, `Subscription`)
//!
//! Both come with in-memory implementations for tests/dev; infrastructure-backed
//! implementations live in `stockflow-infra`.

pub mod bus;
pub mod in_memory_bus;
pub mod in_memory_queue;
pub mod queue;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use in_memory_queue::{DEFAULT_VISIBILITY_TIMEOUT, InMemoryOrderQueue};
pub use queue::{
    AckToken, DeadLetter, InFlightMessage, MAX_BATCH_SIZE, OrderQueue, QueueError, clamp_batch_size,
};
