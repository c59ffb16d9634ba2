//! Notification service: customer messages on provisioning and teardown.

use std::collections::HashMap;

use bus::DedupGuard;
use messages::Event;
use messages::event::{InstanceProvisionedData, InstanceTerminatedData};
use store::Storage;

use crate::error::{Result, ServiceError};
use crate::services::notifier::Notifier;

/// Template for the "your server is ready" message.
pub const PROVISIONED_TEMPLATE: u32 = 1;

/// Template for the "your server was shut down" message.
pub const TERMINATED_TEMPLATE: u32 = 2;

/// Sends transactional messages to resource owners.
///
/// Sending a message is not idempotent, so this consumer leans on its
/// dedup guard: a redelivered event inside the retention window produces
/// no second message.
pub struct NotifyService<S, N, D> {
    storage: S,
    notifier: N,
    dedup: D,
}

impl<S, N, D> NotifyService<S, N, D>
where
    S: Storage,
    N: Notifier,
    D: DedupGuard,
{
    /// Creates a new notify service.
    pub fn new(storage: S, notifier: N, dedup: D) -> Self {
        Self {
            storage,
            notifier,
            dedup,
        }
    }

    /// Tells the owner their server is ready and when it expires.
    #[tracing::instrument(skip(self), fields(resource_id = %data.resource_id))]
    pub async fn handle_instance_provisioned(&self, data: &InstanceProvisionedData) -> Result<()> {
        let fingerprint = Event::InstanceProvisioned(data.clone()).fingerprint();
        if self.dedup.seen_or_mark(&fingerprint).await? {
            metrics::counter!("dedup_hits").increment(1);
            tracing::debug!("duplicate delivery, skipping");
            return Ok(());
        }

        let result = self.send_provisioned(data).await;
        if result.is_err() {
            let _ = self.dedup.forget(&fingerprint).await;
        }
        result
    }

    async fn send_provisioned(&self, data: &InstanceProvisionedData) -> Result<()> {
        let resource = self
            .storage
            .resource(data.resource_id)
            .await?
            .ok_or(ServiceError::ResourceNotFound(data.resource_id))?;
        let instance = self
            .storage
            .instance(data.instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound(data.instance_id))?;

        let mut params = HashMap::new();
        params.insert(
            "hoursReserved".to_string(),
            resource.hours_reserved.to_string(),
        );
        params.insert(
            "terminationDate".to_string(),
            instance.expires_at.to_rfc2822(),
        );

        self.notifier
            .send(&resource.owner_contact, PROVISIONED_TEMPLATE, params)
            .await?;

        metrics::counter!("notifications_sent").increment(1);
        tracing::info!("provisioned notification sent");
        Ok(())
    }

    /// Tells the owner their server was shut down.
    #[tracing::instrument(skip(self), fields(resource_id = %data.resource_id))]
    pub async fn handle_instance_terminated(&self, data: &InstanceTerminatedData) -> Result<()> {
        let fingerprint = Event::InstanceTerminated(data.clone()).fingerprint();
        if self.dedup.seen_or_mark(&fingerprint).await? {
            metrics::counter!("dedup_hits").increment(1);
            tracing::debug!("duplicate delivery, skipping");
            return Ok(());
        }

        let result = self.send_terminated(data).await;
        if result.is_err() {
            let _ = self.dedup.forget(&fingerprint).await;
        }
        result
    }

    async fn send_terminated(&self, data: &InstanceTerminatedData) -> Result<()> {
        let resource = self
            .storage
            .resource(data.resource_id)
            .await?
            .ok_or(ServiceError::ResourceNotFound(data.resource_id))?;

        let mut params = HashMap::new();
        params.insert(
            "hoursReserved".to_string(),
            resource.hours_reserved.to_string(),
        );

        self.notifier
            .send(&resource.owner_contact, TERMINATED_TEMPLATE, params)
            .await?;

        metrics::counter!("notifications_sent").increment(1);
        tracing::info!("terminated notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifier::InMemoryNotifier;
    use bus::InMemoryDedupGuard;
    use common::{InstanceId, ResourceId};
    use lifecycle::{ProvisionedInstance, Resource};
    use store::MemoryStorage;

    type TestService = NotifyService<MemoryStorage, InMemoryNotifier, InMemoryDedupGuard>;

    async fn setup_with_instance() -> (TestService, InMemoryNotifier, Resource, ProvisionedInstance)
    {
        let storage = MemoryStorage::new();
        let notifier = InMemoryNotifier::new();
        let service = NotifyService::new(
            storage.clone(),
            notifier.clone(),
            InMemoryDedupGuard::new(),
        );

        let mut resource = Resource::new(3, "user@example.com", "cs_test_1");
        resource.register_payment(chrono::Utc::now());
        let instance = ProvisionedInstance::new(resource.id, "i-00000001", 3);

        let mut tx = storage.begin().await.unwrap();
        storage.insert_resource(&mut tx, &resource).await.unwrap();
        storage.insert_instance(&mut tx, &instance).await.unwrap();
        storage.commit(tx).await.unwrap();

        (service, notifier, resource, instance)
    }

    #[tokio::test]
    async fn provisioned_notification_reaches_owner() {
        let (service, notifier, resource, instance) = setup_with_instance().await;

        service
            .handle_instance_provisioned(&InstanceProvisionedData {
                resource_id: resource.id,
                instance_id: instance.id,
                provider_instance_id: instance.provider_instance_id.clone(),
            })
            .await
            .unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "user@example.com");
        assert_eq!(sent[0].template_id, PROVISIONED_TEMPLATE);
        assert_eq!(sent[0].params.get("hoursReserved").unwrap(), "3");
        assert!(sent[0].params.contains_key("terminationDate"));
    }

    #[tokio::test]
    async fn duplicate_provisioned_event_sends_once() {
        let (service, notifier, resource, instance) = setup_with_instance().await;
        let data = InstanceProvisionedData {
            resource_id: resource.id,
            instance_id: instance.id,
            provider_instance_id: instance.provider_instance_id.clone(),
        };

        service.handle_instance_provisioned(&data).await.unwrap();
        service.handle_instance_provisioned(&data).await.unwrap();

        assert_eq!(notifier.sent_count(), 1);
    }

    #[tokio::test]
    async fn terminated_notification_reaches_owner() {
        let (service, notifier, resource, _) = setup_with_instance().await;

        service
            .handle_instance_terminated(&InstanceTerminatedData {
                resource_id: resource.id,
            })
            .await
            .unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_id, TERMINATED_TEMPLATE);
    }

    #[tokio::test]
    async fn failed_send_allows_redelivery_to_retry() {
        let (service, notifier, resource, _) = setup_with_instance().await;
        let data = InstanceTerminatedData {
            resource_id: resource.id,
        };

        notifier.set_fail_on_send(true);
        assert!(service.handle_instance_terminated(&data).await.is_err());

        notifier.set_fail_on_send(false);
        service.handle_instance_terminated(&data).await.unwrap();
        assert_eq!(notifier.sent_count(), 1);
    }

    #[tokio::test]
    async fn unknown_resource_errors() {
        let storage = MemoryStorage::new();
        let service = NotifyService::new(
            storage,
            InMemoryNotifier::new(),
            InMemoryDedupGuard::new(),
        );

        let err = service
            .handle_instance_terminated(&InstanceTerminatedData {
                resource_id: ResourceId::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_instance_errors() {
        let (service, _, resource, _) = setup_with_instance().await;

        let err = service
            .handle_instance_provisioned(&InstanceProvisionedData {
                resource_id: resource.id,
                instance_id: InstanceId::new(),
                provider_instance_id: "i-missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InstanceNotFound(_)));
    }
}
