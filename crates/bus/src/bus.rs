use async_trait::async_trait;
use messages::Topic;
use tokio::sync::mpsc;

use crate::Result;
use crate::error::BusError;

/// A message handed to a consumer.
///
/// `attempt` starts at 0 and increments on each redelivery of the same
/// message to the same consumer group.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: serde_json::Value,
    pub attempt: u32,
}

/// A consumer group's attachment to a topic.
///
/// Each group receives every message published on the topic; within a
/// group, each message is consumed once (plus redeliveries).
pub struct Subscription {
    topic: Topic,
    group: String,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub(crate) fn new(
        topic: Topic,
        group: String,
        tx: mpsc::UnboundedSender<Delivery>,
        rx: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            topic,
            group,
            tx,
            rx,
        }
    }

    /// The topic this subscription is attached to.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// The consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Receives the next delivery. Returns None once the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Puts a delivery back on this group's queue with its attempt count
    /// incremented. Used by the consumer loop after a handler failure.
    pub fn redeliver(&self, delivery: Delivery) -> Result<()> {
        self.tx
            .send(Delivery {
                payload: delivery.payload,
                attempt: delivery.attempt + 1,
            })
            .map_err(|_| BusError::SubscriptionClosed {
                topic: self.topic,
                group: self.group.clone(),
            })
    }
}

/// Topic-based publish/subscribe transport.
///
/// Delivery is at least once: a published message reaches every consumer
/// group subscribed to the topic, and a group may see the same message
/// again after a handler failure. Consumers are expected to deduplicate.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message to a topic.
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> Result<()>;

    /// Attaches a consumer group to a topic.
    ///
    /// The group only receives messages published after it subscribes, so
    /// services wire up all subscriptions before starting the relay.
    async fn subscribe(&self, topic: Topic, group: &str) -> Subscription;
}
