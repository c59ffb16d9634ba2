//! The billable server resource owned by the checkout boundary.

use chrono::{DateTime, Utc};
use common::ResourceId;
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// A requested (and eventually paid-for) server.
///
/// Created when a customer starts a checkout session; mutated exactly once
/// when the payment confirmation arrives; immutable afterwards except for
/// `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    /// Contact address of the purchaser, used for notifications.
    pub owner_contact: String,
    /// Reservation length in hours.
    pub hours_reserved: u32,
    /// The payment session reference handed out by the gateway.
    pub payment_ref: String,
    /// Set at most once, when the gateway confirms the payment.
    pub payment_received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Creates a new requested resource.
    pub fn new(
        hours_reserved: u32,
        owner_contact: impl Into<String>,
        payment_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            owner_contact: owner_contact.into(),
            hours_reserved,
            payment_ref: payment_ref.into(),
            payment_received_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the resource as paid for.
    ///
    /// Returns false if a payment was already registered; the record is
    /// left untouched in that case so redelivered confirmations are safe.
    pub fn register_payment(&mut self, at: DateTime<Utc>) -> bool {
        if self.payment_received_at.is_some() {
            return false;
        }
        self.payment_received_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Returns the lifecycle stage visible from this record alone.
    ///
    /// Stages past `PaymentReceived` live on the provisioned instance.
    pub fn stage(&self) -> Stage {
        if self.payment_received_at.is_some() {
            Stage::PaymentReceived
        } else {
            Stage::Requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_resource_is_requested() {
        let resource = Resource::new(3, "user@example.com", "cs_test_123");
        assert_eq!(resource.stage(), Stage::Requested);
        assert!(resource.payment_received_at.is_none());
        assert_eq!(resource.hours_reserved, 3);
    }

    #[test]
    fn register_payment_advances_stage() {
        let mut resource = Resource::new(3, "user@example.com", "cs_test_123");
        let now = Utc::now();

        assert!(resource.register_payment(now));
        assert_eq!(resource.payment_received_at, Some(now));
        assert_eq!(resource.stage(), Stage::PaymentReceived);
    }

    #[test]
    fn register_payment_twice_is_noop() {
        let mut resource = Resource::new(3, "user@example.com", "cs_test_123");
        let first = Utc::now();

        assert!(resource.register_payment(first));
        let later = Utc::now();
        assert!(!resource.register_payment(later));
        // Timestamp from the first registration wins.
        assert_eq!(resource.payment_received_at, Some(first));
    }

    #[test]
    fn serialization_roundtrip() {
        let resource = Resource::new(5, "user@example.com", "cs_test_456");
        let json = serde_json::to_string(&resource).unwrap();
        let deserialized: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(resource, deserialized);
    }
}
