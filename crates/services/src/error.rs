//! Service error types.

use bus::BusError;
use common::{InstanceId, ResourceId};
use store::StoreError;
use thiserror::Error;

/// Errors that can occur in the lifecycle services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The requested reservation length is not a sellable package.
    #[error("Unknown package size: {hours} hours")]
    UnknownPackage { hours: u32 },

    /// Webhook signature verification failed. Never retried.
    #[error("Webhook signature rejected")]
    SignatureRejected,

    /// The webhook body could not be parsed after signature verification.
    #[error("Malformed webhook payload: {0}")]
    MalformedWebhook(String),

    /// A payment confirmation arrived for a session we never issued.
    #[error("No resource for payment reference '{0}'")]
    UnknownPaymentRef(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// Instance not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// An external collaborator (payment gateway, cloud provider, mail
    /// provider) is unreachable or rate-limited. Retryable: the enclosing
    /// transaction aborts and redelivery makes the next attempt.
    #[error("Transient {service} failure: {reason}")]
    TransientUpstream {
        service: &'static str,
        reason: String,
    },

    /// Storage error. Always aborts the enclosing transaction.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Bus error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServiceError {
    /// Returns true if the failure is worth retrying (e.g. mapped to a 503
    /// on a synchronous webhook so the caller redelivers).
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::TransientUpstream { .. })
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
