use chrono::{DateTime, Utc};
use messages::{Event, Topic};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a message ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A staged outgoing event.
///
/// Rows are written inside the same local transaction as the business
/// mutation that produced them, so a rolled-back transaction leaves no
/// message behind. The relay publishes committed rows and sets
/// `published_at`; a row whose `published_at` is set is never fetched
/// again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub topic: Topic,
    /// The serialized [`Event`].
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Stages an event for publishing on its topic.
    pub fn for_event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: MessageId::new(),
            topic: event.topic(),
            payload: serde_json::to_value(event)?,
            created_at: Utc::now(),
            published_at: None,
        })
    }

    /// Decodes the payload back into the domain event.
    pub fn event(&self) -> Result<Event, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
