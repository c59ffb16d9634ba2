//! The domain event envelope.

use common::{InstanceId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::topic::Topic;

/// Events published on the message bus.
///
/// Each variant maps to exactly one topic. The bus delivers at least once,
/// so every event exposes a [`fingerprint`](Event::fingerprint) derived
/// from its identity that consumers use to detect redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A payment for a requested server has been confirmed.
    PaymentReceived(PaymentReceivedData),

    /// A cloud instance has been provisioned for a paid resource.
    InstanceProvisioned(InstanceProvisionedData),

    /// An instance has aged out and is scheduled for teardown.
    TerminationScheduled(TerminationScheduledData),

    /// An instance has been torn down.
    InstanceTerminated(InstanceTerminatedData),
}

/// Data for the PaymentReceived event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceivedData {
    /// The resource that was paid for.
    pub resource_id: ResourceId,
    /// Reservation length in hours, carried so the provisioner can compute
    /// the instance expiry without a cross-service lookup.
    pub hours_reserved: u32,
}

/// Data for the InstanceProvisioned event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProvisionedData {
    pub resource_id: ResourceId,
    /// The instance record created by the provisioner.
    pub instance_id: InstanceId,
    /// The identifier assigned by the cloud provider.
    pub provider_instance_id: String,
}

/// Data for the TerminationScheduled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationScheduledData {
    pub instance_id: InstanceId,
    pub provider_instance_id: String,
}

/// Data for the InstanceTerminated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTerminatedData {
    pub resource_id: ResourceId,
}

impl Event {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::PaymentReceived(_) => "PaymentReceived",
            Event::InstanceProvisioned(_) => "InstanceProvisioned",
            Event::TerminationScheduled(_) => "TerminationScheduled",
            Event::InstanceTerminated(_) => "InstanceTerminated",
        }
    }

    /// Returns the topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::PaymentReceived(_) => Topic::PaymentReceived,
            Event::InstanceProvisioned(_) => Topic::InstanceProvisioned,
            Event::TerminationScheduled(_) => Topic::TerminationScheduled,
            Event::InstanceTerminated(_) => Topic::InstanceTerminated,
        }
    }

    /// Returns the stable delivery fingerprint for this event.
    ///
    /// The fingerprint is derived from the event kind plus the identity of
    /// the aggregate it concerns, so a redelivered message always produces
    /// the same value.
    pub fn fingerprint(&self) -> String {
        match self {
            Event::PaymentReceived(data) => {
                format!("{}/{}", self.topic(), data.resource_id)
            }
            Event::InstanceProvisioned(data) => {
                format!("{}/{}", self.topic(), data.instance_id)
            }
            Event::TerminationScheduled(data) => {
                format!("{}/{}", self.topic(), data.instance_id)
            }
            Event::InstanceTerminated(data) => {
                format!("{}/{}", self.topic(), data.resource_id)
            }
        }
    }

    // Convenience constructors

    /// Creates a PaymentReceived event.
    pub fn payment_received(resource_id: ResourceId, hours_reserved: u32) -> Self {
        Event::PaymentReceived(PaymentReceivedData {
            resource_id,
            hours_reserved,
        })
    }

    /// Creates an InstanceProvisioned event.
    pub fn instance_provisioned(
        resource_id: ResourceId,
        instance_id: InstanceId,
        provider_instance_id: impl Into<String>,
    ) -> Self {
        Event::InstanceProvisioned(InstanceProvisionedData {
            resource_id,
            instance_id,
            provider_instance_id: provider_instance_id.into(),
        })
    }

    /// Creates a TerminationScheduled event.
    pub fn termination_scheduled(
        instance_id: InstanceId,
        provider_instance_id: impl Into<String>,
    ) -> Self {
        Event::TerminationScheduled(TerminationScheduledData {
            instance_id,
            provider_instance_id: provider_instance_id.into(),
        })
    }

    /// Creates an InstanceTerminated event.
    pub fn instance_terminated(resource_id: ResourceId) -> Self {
        Event::InstanceTerminated(InstanceTerminatedData { resource_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_variant() {
        let resource_id = ResourceId::new();
        let instance_id = InstanceId::new();

        assert_eq!(
            Event::payment_received(resource_id, 3).event_type(),
            "PaymentReceived"
        );
        assert_eq!(
            Event::instance_provisioned(resource_id, instance_id, "i-0abc").event_type(),
            "InstanceProvisioned"
        );
        assert_eq!(
            Event::termination_scheduled(instance_id, "i-0abc").event_type(),
            "TerminationScheduled"
        );
        assert_eq!(
            Event::instance_terminated(resource_id).event_type(),
            "InstanceTerminated"
        );
    }

    #[test]
    fn topic_matches_variant() {
        let resource_id = ResourceId::new();
        let instance_id = InstanceId::new();

        assert_eq!(
            Event::payment_received(resource_id, 3).topic(),
            Topic::PaymentReceived
        );
        assert_eq!(
            Event::instance_provisioned(resource_id, instance_id, "i-0abc").topic(),
            Topic::InstanceProvisioned
        );
        assert_eq!(
            Event::termination_scheduled(instance_id, "i-0abc").topic(),
            Topic::TerminationScheduled
        );
        assert_eq!(
            Event::instance_terminated(resource_id).topic(),
            Topic::InstanceTerminated
        );
    }

    #[test]
    fn fingerprint_is_stable_across_redelivery() {
        let resource_id = ResourceId::new();

        let first = Event::payment_received(resource_id, 3);
        let redelivered = Event::payment_received(resource_id, 3);
        assert_eq!(first.fingerprint(), redelivered.fingerprint());
    }

    #[test]
    fn fingerprint_differs_per_kind_and_aggregate() {
        let resource_id = ResourceId::new();
        let other = ResourceId::new();

        assert_ne!(
            Event::payment_received(resource_id, 3).fingerprint(),
            Event::payment_received(other, 3).fingerprint()
        );
        assert_ne!(
            Event::payment_received(resource_id, 3).fingerprint(),
            Event::instance_terminated(resource_id).fingerprint()
        );
    }

    #[test]
    fn serialization_roundtrip() {
        let resource_id = ResourceId::new();
        let instance_id = InstanceId::new();

        let events = vec![
            Event::payment_received(resource_id, 5),
            Event::instance_provisioned(resource_id, instance_id, "i-0abc"),
            Event::termination_scheduled(instance_id, "i-0abc"),
            Event::instance_terminated(resource_id),
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let deserialized: Event = serde_json::from_str(&json).unwrap();
            assert_eq!(event, deserialized);
        }
    }
}
