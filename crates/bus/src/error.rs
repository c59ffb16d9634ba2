use messages::Topic;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur on the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing to the transport failed; the message stays unpublished
    /// and is retried on the next relay pass.
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: Topic, reason: String },

    /// A consumer group's channel is gone.
    #[error("Subscription {group} on {topic} is closed")]
    SubscriptionClosed { topic: Topic, group: String },

    /// Storage error while relaying.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
