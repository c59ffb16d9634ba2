//! Message bus topics.

use serde::{Deserialize, Serialize};

/// A message bus topic. One topic per event kind; subscribers attach to a
/// topic with their own consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A payment for a requested server has been confirmed.
    PaymentReceived,

    /// A cloud instance has been provisioned for a paid resource.
    InstanceProvisioned,

    /// An instance has aged out and is scheduled for teardown.
    TerminationScheduled,

    /// An instance has been torn down.
    InstanceTerminated,
}

impl Topic {
    /// All topics, in lifecycle order.
    pub const ALL: [Topic; 4] = [
        Topic::PaymentReceived,
        Topic::InstanceProvisioned,
        Topic::TerminationScheduled,
        Topic::InstanceTerminated,
    ];

    /// Returns the wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PaymentReceived => "payment-received",
            Topic::InstanceProvisioned => "instance-provisioned",
            Topic::TerminationScheduled => "termination-scheduled",
            Topic::InstanceTerminated => "instance-terminated",
        }
    }

    /// Parses a wire name back into a topic.
    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
