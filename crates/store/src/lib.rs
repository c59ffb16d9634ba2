pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use common::{InstanceId, ResourceId};
pub use error::{Result, StoreError};
pub use memory::MemoryStorage;
pub use outbox::{MessageId, OutboxMessage};
pub use postgres::PostgresStorage;
pub use store::Storage;
