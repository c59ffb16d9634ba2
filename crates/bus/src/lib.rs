//! Message transport for the lifecycle services.
//!
//! Three pieces live here: the [`MessageBus`] abstraction with its
//! in-memory implementation (topic × consumer-group fan-out, at-least-once
//! delivery with bounded redelivery), the [`Relay`] that moves committed
//! outbox rows onto the bus, and the [`DedupGuard`] consumers use to
//! detect redelivered messages.

pub mod bus;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod memory;
pub mod relay;

pub use bus::{Delivery, MessageBus, Subscription};
pub use consumer::{ConsumerHandle, RetryPolicy, spawn_consumer};
pub use dedup::{DedupGuard, InMemoryDedupGuard};
pub use error::{BusError, Result};
pub use memory::InMemoryBus;
pub use relay::{Relay, RelayHandle};
