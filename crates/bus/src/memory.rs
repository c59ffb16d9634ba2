use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use messages::Topic;
use tokio::sync::{RwLock, mpsc};

use crate::Result;
use crate::bus::{Delivery, MessageBus, Subscription};
use crate::error::BusError;

type GroupSenders = HashMap<Topic, HashMap<String, mpsc::UnboundedSender<Delivery>>>;

/// In-memory message bus for tests and single-process deployments.
///
/// Fan-out is per consumer group: every group subscribed to a topic gets
/// its own queue, and publish pushes one delivery into each queue. The
/// `fail_publish` switch simulates transport outages so relay retry
/// behavior can be exercised.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    groups: Arc<RwLock<GroupSenders>>,
    fail_publish: Arc<AtomicBool>,
}

impl InMemoryBus {
    /// Creates a new bus with no subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail until reset. Simulates an unreachable
    /// transport.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic,
                reason: "transport unavailable".to_string(),
            });
        }

        let groups = self.groups.read().await;
        if let Some(subscribers) = groups.get(&topic) {
            for tx in subscribers.values() {
                // A dropped subscription just stops receiving; that's not
                // a publish failure.
                let _ = tx.send(Delivery {
                    payload: payload.clone(),
                    attempt: 0,
                });
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut groups = self.groups.write().await;
        groups
            .entry(topic)
            .or_default()
            .insert(group.to_string(), tx.clone());

        Subscription::new(topic, group.to_string(), tx, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_every_group() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe(Topic::PaymentReceived, "group-a").await;
        let mut second = bus.subscribe(Topic::PaymentReceived, "group-b").await;

        bus.publish(Topic::PaymentReceived, json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(first.recv().await.unwrap().payload, json!({"n": 1}));
        assert_eq!(second.recv().await.unwrap().payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn publish_does_not_cross_topics() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(Topic::InstanceProvisioned, "group-a").await;

        bus.publish(Topic::PaymentReceived, json!({"n": 1}))
            .await
            .unwrap();
        bus.publish(Topic::InstanceProvisioned, json!({"n": 2}))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().payload, json!({"n": 2}));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryBus::new();
        bus.publish(Topic::InstanceTerminated, json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_publish_returns_error() {
        let bus = InMemoryBus::new();
        bus.set_fail_publish(true);

        let result = bus.publish(Topic::PaymentReceived, json!({})).await;
        assert!(matches!(result, Err(BusError::Publish { .. })));

        bus.set_fail_publish(false);
        bus.publish(Topic::PaymentReceived, json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn redeliver_increments_attempt() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(Topic::PaymentReceived, "group-a").await;

        bus.publish(Topic::PaymentReceived, json!({"n": 1}))
            .await
            .unwrap();

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.attempt, 0);

        sub.redeliver(delivery).unwrap();
        let redelivered = sub.recv().await.unwrap();
        assert_eq!(redelivered.attempt, 1);
        assert_eq!(redelivered.payload, json!({"n": 1}));
    }
}
