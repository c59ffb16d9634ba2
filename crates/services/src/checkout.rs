//! Checkout service: selling a server and registering its payment.

use chrono::Utc;
use common::ResourceId;
use lifecycle::Resource;
use messages::Event;
use store::{OutboxMessage, Storage};

use crate::error::{Result, ServiceError};
use crate::services::payment::PaymentGateway;

/// Reservation lengths that can be purchased, in hours.
pub const PACKAGE_HOURS: [u32; 4] = [1, 3, 5, 10];

/// Result of requesting a server.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub resource_id: ResourceId,
    /// Where to send the customer to complete payment.
    pub payment_redirect: String,
}

/// Handles the purchase side of the lifecycle.
///
/// `request_resource` creates the resource; `register_payment` applies the
/// `Requested → PaymentReceived` transition and stages the event that
/// kicks off provisioning, both inside one local transaction.
pub struct CheckoutService<S, P> {
    storage: S,
    payments: P,
}

impl<S, P> CheckoutService<S, P>
where
    S: Storage,
    P: PaymentGateway,
{
    /// Creates a new checkout service.
    pub fn new(storage: S, payments: P) -> Self {
        Self { storage, payments }
    }

    /// Requests a new server: starts a payment session and persists the
    /// resource carrying the session reference.
    #[tracing::instrument(skip(self))]
    pub async fn request_resource(
        &self,
        hours_reserved: u32,
        owner_contact: &str,
    ) -> Result<ResourceRequest> {
        if !PACKAGE_HOURS.contains(&hours_reserved) {
            return Err(ServiceError::UnknownPackage {
                hours: hours_reserved,
            });
        }

        let mut tx = self.storage.begin().await?;

        let session = self
            .payments
            .start_session(hours_reserved, owner_contact)
            .await?;

        let resource = Resource::new(hours_reserved, owner_contact, &session.session_ref);
        self.storage.insert_resource(&mut tx, &resource).await?;
        self.storage.commit(tx).await?;

        metrics::counter!("checkout_resources_requested").increment(1);
        tracing::info!(resource_id = %resource.id, hours_reserved, "server requested");

        Ok(ResourceRequest {
            resource_id: resource.id,
            payment_redirect: session.redirect_url,
        })
    }

    /// Handles a raw payment-completion webhook: verifies the signature,
    /// then registers the payment for the referenced session.
    #[tracing::instrument(skip(self, payload, signature))]
    pub async fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<()> {
        let session_ref = self.payments.verify_completion(payload, signature)?;
        self.register_payment(&session_ref).await
    }

    /// Marks the resource paid and stages the `PaymentReceived` event.
    ///
    /// `payment_received_at` is set at most once; a redelivered
    /// confirmation for an already-paid resource is a safe no-op and
    /// stages nothing.
    #[tracing::instrument(skip(self))]
    pub async fn register_payment(&self, payment_ref: &str) -> Result<()> {
        let mut tx = self.storage.begin().await?;

        let Some(mut resource) = self
            .storage
            .resource_by_payment_ref(&mut tx, payment_ref)
            .await?
        else {
            return Err(ServiceError::UnknownPaymentRef(payment_ref.to_string()));
        };

        if !resource.register_payment(Utc::now()) {
            tracing::debug!(resource_id = %resource.id, "payment already registered, skipping");
            return Ok(());
        }

        self.storage.update_resource(&mut tx, &resource).await?;

        let message =
            OutboxMessage::for_event(&Event::payment_received(resource.id, resource.hours_reserved))?;
        self.storage.stage(&mut tx, message).await?;

        self.storage.commit(tx).await?;

        metrics::counter!("checkout_payments_registered").increment(1);
        tracing::info!(resource_id = %resource.id, "payment registered");

        Ok(())
    }

    /// Loads a resource by ID.
    #[tracing::instrument(skip(self))]
    pub async fn resource_details(&self, id: ResourceId) -> Result<Resource> {
        self.storage
            .resource(id)
            .await?
            .ok_or(ServiceError::ResourceNotFound(id))
    }
}
