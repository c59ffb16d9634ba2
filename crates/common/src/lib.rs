pub mod types;

pub use types::{InstanceId, ResourceId};
