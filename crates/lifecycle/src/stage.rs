//! Lifecycle stage state machine.

use serde::{Deserialize, Serialize};

/// The stage of a server resource in its lifecycle.
///
/// Stage transitions:
/// ```text
/// Requested ──► PaymentReceived ──► Provisioned ──► TerminationScheduled ──► Terminated
/// ```
///
/// Transitions are strictly forward; nothing reverses or skips a stage.
/// `Requested → PaymentReceived` (payment webhook) and
/// `Provisioned → TerminationScheduled` (expiry scan or operator action)
/// are the externally triggered edges; the rest are system-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Stage {
    /// A server has been requested; payment is outstanding.
    #[default]
    Requested,

    /// Payment confirmed, provisioning pending.
    PaymentReceived,

    /// A cloud instance is running for this resource.
    Provisioned,

    /// The instance has aged out and teardown is pending.
    TerminationScheduled,

    /// The instance has been torn down (terminal state).
    Terminated,
}

impl Stage {
    /// Returns true if a payment can be registered in this stage.
    pub fn can_register_payment(&self) -> bool {
        matches!(self, Stage::Requested)
    }

    /// Returns true if an instance can be provisioned in this stage.
    pub fn can_provision(&self) -> bool {
        matches!(self, Stage::PaymentReceived)
    }

    /// Returns true if termination can be scheduled in this stage.
    pub fn can_schedule_termination(&self) -> bool {
        matches!(self, Stage::Provisioned)
    }

    /// Returns true if the instance can be terminated in this stage.
    pub fn can_terminate(&self) -> bool {
        matches!(self, Stage::TerminationScheduled)
    }

    /// Returns true if this is the terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Terminated)
    }

    /// Returns the stage name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Requested => "Requested",
            Stage::PaymentReceived => "PaymentReceived",
            Stage::Provisioned => "Provisioned",
            Stage::TerminationScheduled => "TerminationScheduled",
            Stage::Terminated => "Terminated",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
