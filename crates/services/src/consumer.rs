//! Subscription wiring: one consumer group per saga handler.
//!
//! Dispatch is explicit: each group decodes the event envelope and matches
//! the variant it owns; anything else on the topic is logged and skipped.
//! Undecodable payloads are dropped rather than retried, since redelivery
//! cannot fix a poison message.

use std::sync::Arc;

use bus::{ConsumerHandle, DedupGuard, MessageBus, RetryPolicy, spawn_consumer};
use messages::{Event, Topic};
use store::Storage;

use crate::notify::NotifyService;
use crate::provisioning::ProvisioningService;
use crate::services::notifier::Notifier;
use crate::services::provisioner::Provisioner;

/// Consumer group that provisions instances on confirmed payments.
pub const PROVISIONER_GROUP: &str = "instance-provisioner";

/// Consumer group that tears down scheduled instances.
pub const TERMINATOR_GROUP: &str = "instance-terminator";

/// Consumer group that notifies owners of fresh instances.
pub const PROVISIONED_NOTIFIER_GROUP: &str = "provisioned-notifier";

/// Consumer group that notifies owners of torn-down instances.
pub const TERMINATED_NOTIFIER_GROUP: &str = "terminated-notifier";

/// Handles for all running consumers, shut down together.
pub struct ConsumerSet {
    handles: Vec<ConsumerHandle>,
}

impl ConsumerSet {
    /// Stops every consumer and waits for them to exit.
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await;
        }
    }
}

fn decode(payload: serde_json::Value) -> Option<Event> {
    match serde_json::from_value(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!(error = %e, "dropping undecodable message");
            None
        }
    }
}

/// Subscribes every saga handler to its topic and spawns the consumers.
///
/// Call before starting the relay so no published message races the
/// subscriptions.
pub async fn start_consumers<B, SP, P, DP, SN, N, DN>(
    bus: &B,
    provisioning: Arc<ProvisioningService<SP, P, DP>>,
    notify: Arc<NotifyService<SN, N, DN>>,
) -> ConsumerSet
where
    B: MessageBus,
    SP: Storage + 'static,
    P: Provisioner + 'static,
    DP: DedupGuard + 'static,
    SN: Storage + 'static,
    N: Notifier + 'static,
    DN: DedupGuard + 'static,
{
    let mut handles = Vec::new();

    {
        let sub = bus.subscribe(Topic::PaymentReceived, PROVISIONER_GROUP).await;
        let svc = Arc::clone(&provisioning);
        handles.push(spawn_consumer(
            sub,
            RetryPolicy { max_retries: 10 },
            move |payload| {
                let svc = Arc::clone(&svc);
                async move {
                    match decode(payload) {
                        Some(Event::PaymentReceived(data)) => {
                            svc.handle_payment_received(&data).await
                        }
                        Some(other) => {
                            tracing::warn!(kind = other.event_type(), "unexpected event, skipping");
                            Ok(())
                        }
                        None => Ok(()),
                    }
                }
            },
        ));
    }

    {
        let sub = bus.subscribe(Topic::TerminationScheduled, TERMINATOR_GROUP).await;
        let svc = Arc::clone(&provisioning);
        handles.push(spawn_consumer(
            sub,
            RetryPolicy { max_retries: 10 },
            move |payload| {
                let svc = Arc::clone(&svc);
                async move {
                    match decode(payload) {
                        Some(Event::TerminationScheduled(data)) => {
                            svc.handle_termination_scheduled(&data).await
                        }
                        Some(other) => {
                            tracing::warn!(kind = other.event_type(), "unexpected event, skipping");
                            Ok(())
                        }
                        None => Ok(()),
                    }
                }
            },
        ));
    }

    {
        let sub = bus
            .subscribe(Topic::InstanceProvisioned, PROVISIONED_NOTIFIER_GROUP)
            .await;
        let svc = Arc::clone(&notify);
        handles.push(spawn_consumer(
            sub,
            RetryPolicy { max_retries: 20 },
            move |payload| {
                let svc = Arc::clone(&svc);
                async move {
                    match decode(payload) {
                        Some(Event::InstanceProvisioned(data)) => {
                            svc.handle_instance_provisioned(&data).await
                        }
                        Some(other) => {
                            tracing::warn!(kind = other.event_type(), "unexpected event, skipping");
                            Ok(())
                        }
                        None => Ok(()),
                    }
                }
            },
        ));
    }

    {
        let sub = bus
            .subscribe(Topic::InstanceTerminated, TERMINATED_NOTIFIER_GROUP)
            .await;
        let svc = Arc::clone(&notify);
        handles.push(spawn_consumer(
            sub,
            RetryPolicy { max_retries: 20 },
            move |payload| {
                let svc = Arc::clone(&svc);
                async move {
                    match decode(payload) {
                        Some(Event::InstanceTerminated(data)) => {
                            svc.handle_instance_terminated(&data).await
                        }
                        Some(other) => {
                            tracing::warn!(kind = other.event_type(), "unexpected event, skipping");
                            Ok(())
                        }
                        None => Ok(()),
                    }
                }
            },
        ));
    }

    tracing::info!(consumers = handles.len(), "consumers started");
    ConsumerSet { handles }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifier::InMemoryNotifier;
    use crate::services::provisioner::InMemoryProvisioner;
    use bus::{InMemoryBus, InMemoryDedupGuard};
    use common::ResourceId;
    use store::MemoryStorage;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn payment_event_on_the_bus_provisions_an_instance() {
        let storage = MemoryStorage::new();
        let bus = InMemoryBus::new();
        let provisioner = InMemoryProvisioner::new();

        let provisioning = Arc::new(ProvisioningService::new(
            storage.clone(),
            provisioner.clone(),
            InMemoryDedupGuard::new(),
        ));
        let notify = Arc::new(NotifyService::new(
            storage.clone(),
            InMemoryNotifier::new(),
            InMemoryDedupGuard::new(),
        ));

        let consumers = start_consumers(&bus, provisioning, notify).await;

        let resource_id = ResourceId::new();
        let event = Event::payment_received(resource_id, 3);
        bus.publish(event.topic(), serde_json::to_value(&event).unwrap())
            .await
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while storage
                .instance_for_resource(resource_id)
                .await
                .unwrap()
                .is_none()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("instance never provisioned");

        consumers.shutdown().await;
        assert_eq!(provisioner.provision_count(), 1);
    }
}
