//! Provisioning service: instance launch, teardown, and expiry scanning.

use bus::DedupGuard;
use chrono::{DateTime, Utc};
use common::InstanceId;
use lifecycle::ProvisionedInstance;
use messages::Event;
use messages::event::{PaymentReceivedData, TerminationScheduledData};
use store::{OutboxMessage, Storage};

use crate::error::{Result, ServiceError};
use crate::services::provisioner::Provisioner;

/// How many expired rows one scanner pass claims.
pub const TERMINATION_BATCH_SIZE: u32 = 20;

/// Connection and expiry details for a provisioned instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub admin_url: String,
    pub ip_addr: String,
    pub expires_at: DateTime<Utc>,
}

/// Owns the provisioned-instance side of the lifecycle.
///
/// Each handler is one saga step: read state, validate the transition,
/// perform the external side effect, persist, and stage the successor
/// event, all inside a single local transaction. The provisioning call is
/// deliberately kept inside the transaction so "provisioned" always
/// implies "durably recorded"; a timeout rolls the whole step back and
/// redelivery retries it.
pub struct ProvisioningService<S, P, D> {
    storage: S,
    provisioner: P,
    dedup: D,
}

impl<S, P, D> ProvisioningService<S, P, D>
where
    S: Storage,
    P: Provisioner,
    D: DedupGuard,
{
    /// Creates a new provisioning service.
    pub fn new(storage: S, provisioner: P, dedup: D) -> Self {
        Self {
            storage,
            provisioner,
            dedup,
        }
    }

    /// Provisions an instance after a confirmed payment.
    ///
    /// Idempotent under redelivery twice over: the dedup guard short-cuts
    /// recent duplicates, and an existing instance record for the resource
    /// makes the handler a no-op even after the guard's retention window.
    #[tracing::instrument(skip(self), fields(resource_id = %data.resource_id))]
    pub async fn handle_payment_received(&self, data: &PaymentReceivedData) -> Result<()> {
        let fingerprint = Event::PaymentReceived(data.clone()).fingerprint();
        if self.dedup.seen_or_mark(&fingerprint).await? {
            metrics::counter!("dedup_hits").increment(1);
            tracing::debug!("duplicate delivery, skipping");
            return Ok(());
        }

        match self.provision_resource(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The work didn't happen; clear the mark so the
                // redelivered message isn't mistaken for processed.
                let _ = self.dedup.forget(&fingerprint).await;
                Err(e)
            }
        }
    }

    async fn provision_resource(&self, data: &PaymentReceivedData) -> Result<()> {
        if self
            .storage
            .instance_for_resource(data.resource_id)
            .await?
            .is_some()
        {
            tracing::debug!("instance already provisioned, skipping");
            return Ok(());
        }

        let mut tx = self.storage.begin().await?;

        let provider_instance_id = self.provisioner.provision(data.resource_id).await?;

        let instance =
            ProvisionedInstance::new(data.resource_id, &provider_instance_id, data.hours_reserved);
        self.storage.insert_instance(&mut tx, &instance).await?;

        let message = OutboxMessage::for_event(&Event::instance_provisioned(
            data.resource_id,
            instance.id,
            &provider_instance_id,
        ))?;
        self.storage.stage(&mut tx, message).await?;

        self.storage.commit(tx).await?;

        metrics::counter!("instances_provisioned").increment(1);
        tracing::info!(
            instance_id = %instance.id,
            provider_instance_id,
            expires_at = %instance.expires_at,
            "instance provisioned"
        );

        Ok(())
    }

    /// Tears down an instance whose termination was scheduled.
    ///
    /// Persists the fully updated record, termination timestamp included.
    /// A redelivered event for an already-terminated instance is a safe
    /// no-op.
    #[tracing::instrument(skip(self), fields(instance_id = %data.instance_id))]
    pub async fn handle_termination_scheduled(
        &self,
        data: &TerminationScheduledData,
    ) -> Result<()> {
        let mut tx = self.storage.begin().await?;

        let Some(mut instance) = self
            .storage
            .instance_for_update(&mut tx, data.instance_id)
            .await?
        else {
            return Err(ServiceError::InstanceNotFound(data.instance_id));
        };

        if !instance.terminate(Utc::now()) {
            tracing::debug!("instance already terminated, skipping");
            return Ok(());
        }

        self.provisioner
            .terminate(&instance.provider_instance_id)
            .await?;

        self.storage.update_instance(&mut tx, &instance).await?;

        let message =
            OutboxMessage::for_event(&Event::instance_terminated(instance.resource_id))?;
        self.storage.stage(&mut tx, message).await?;

        self.storage.commit(tx).await?;

        metrics::counter!("instances_terminated").increment(1);
        tracing::info!(resource_id = %instance.resource_id, "instance terminated");

        Ok(())
    }

    /// One expiry-scanner pass: claims up to [`TERMINATION_BATCH_SIZE`]
    /// expired rows with lock-or-skip locks, marks each as scheduled, and
    /// stages one `TerminationScheduled` event per row, in a single
    /// transaction.
    ///
    /// Rows claimed by a concurrent pass are skipped and picked up on a
    /// later tick. Returns how many instances were scheduled.
    #[tracing::instrument(skip(self))]
    pub async fn schedule_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.storage.begin().await?;

        let batch = self
            .storage
            .expired_instances(&mut tx, now, TERMINATION_BATCH_SIZE)
            .await?;

        let mut scheduled = 0;
        for mut instance in batch {
            if !instance.schedule_termination(now) {
                continue;
            }

            self.storage.update_instance(&mut tx, &instance).await?;

            let message = OutboxMessage::for_event(&Event::termination_scheduled(
                instance.id,
                &instance.provider_instance_id,
            ))?;
            self.storage.stage(&mut tx, message).await?;
            scheduled += 1;
        }

        self.storage.commit(tx).await?;

        if scheduled > 0 {
            metrics::counter!("expiry_scanner_scheduled").increment(scheduled as u64);
            tracing::info!(scheduled, "expired instances scheduled for termination");
        }

        Ok(scheduled)
    }

    /// Looks up connection details and the expiry of an instance.
    #[tracing::instrument(skip(self))]
    pub async fn instance_details(&self, id: InstanceId) -> Result<InstanceInfo> {
        let instance = self
            .storage
            .instance(id)
            .await?
            .ok_or(ServiceError::InstanceNotFound(id))?;

        let details = self
            .provisioner
            .describe(&instance.provider_instance_id)
            .await?;

        Ok(InstanceInfo {
            admin_url: details.admin_url,
            ip_addr: details.ip_addr,
            expires_at: instance.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provisioner::InMemoryProvisioner;
    use bus::InMemoryDedupGuard;
    use chrono::Duration;
    use common::ResourceId;
    use messages::Topic;
    use store::MemoryStorage;

    type TestService = ProvisioningService<MemoryStorage, InMemoryProvisioner, InMemoryDedupGuard>;

    fn setup() -> (TestService, MemoryStorage, InMemoryProvisioner) {
        setup_with_guard(InMemoryDedupGuard::new())
    }

    fn setup_with_guard(
        dedup: InMemoryDedupGuard,
    ) -> (TestService, MemoryStorage, InMemoryProvisioner) {
        let storage = MemoryStorage::new();
        let provisioner = InMemoryProvisioner::new();
        let service = ProvisioningService::new(storage.clone(), provisioner.clone(), dedup);
        (service, storage, provisioner)
    }

    fn payment(resource_id: ResourceId, hours: u32) -> PaymentReceivedData {
        PaymentReceivedData {
            resource_id,
            hours_reserved: hours,
        }
    }

    async fn seed_expired_instance(storage: &MemoryStorage) -> ProvisionedInstance {
        let mut instance = ProvisionedInstance::new(ResourceId::new(), "i-00000001", 1);
        instance.expires_at = Utc::now() - Duration::minutes(1);

        let mut tx = storage.begin().await.unwrap();
        storage.insert_instance(&mut tx, &instance).await.unwrap();
        storage.commit(tx).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn payment_received_provisions_with_grace_window() {
        let (service, storage, provisioner) = setup();
        let resource_id = ResourceId::new();

        let before = Utc::now();
        service
            .handle_payment_received(&payment(resource_id, 3))
            .await
            .unwrap();

        let instance = storage
            .instance_for_resource(resource_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(provisioner.provision_count(), 1);
        assert!(provisioner.is_running(&instance.provider_instance_id));

        let lower = before + Duration::hours(3) + Duration::minutes(lifecycle::GRACE_MINUTES);
        assert!(instance.expires_at >= lower);

        let staged = storage.fetch_unpublished(10).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].topic, Topic::InstanceProvisioned);
    }

    #[tokio::test]
    async fn duplicate_payment_delivery_provisions_once() {
        let (service, storage, provisioner) = setup();
        let resource_id = ResourceId::new();
        let data = payment(resource_id, 3);

        service.handle_payment_received(&data).await.unwrap();
        service.handle_payment_received(&data).await.unwrap();

        assert_eq!(provisioner.provision_count(), 1);
        assert_eq!(storage.message_count(), 1);
    }

    #[tokio::test]
    async fn redelivery_after_dedup_expiry_is_caught_by_state() {
        // Retention so short every redelivery misses the guard; the
        // existing instance record must catch the duplicate instead.
        let guard = InMemoryDedupGuard::with_retention(std::time::Duration::from_millis(1));
        let (service, storage, provisioner) = setup_with_guard(guard);
        let data = payment(ResourceId::new(), 3);

        service.handle_payment_received(&data).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        service.handle_payment_received(&data).await.unwrap();

        assert_eq!(provisioner.provision_count(), 1);
        assert_eq!(storage.message_count(), 1);
    }

    #[tokio::test]
    async fn failed_provisioning_leaves_no_state_and_allows_retry() {
        let (service, storage, provisioner) = setup();
        let data = payment(ResourceId::new(), 3);

        provisioner.set_fail_on_provision(true);
        let err = service.handle_payment_received(&data).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(storage.message_count(), 0);
        assert!(
            storage
                .instance_for_resource(data.resource_id)
                .await
                .unwrap()
                .is_none()
        );

        // Redelivery after the transient failure succeeds; the dedup mark
        // from the failed attempt must not block it.
        provisioner.set_fail_on_provision(false);
        service.handle_payment_received(&data).await.unwrap();
        assert_eq!(provisioner.provision_count(), 1);
    }

    #[tokio::test]
    async fn termination_persists_post_termination_record() {
        let (service, storage, provisioner) = setup();
        let instance = seed_expired_instance(&storage).await;
        // Mirror the running instance at the provider.
        provisioner.provision(instance.resource_id).await.unwrap();

        service.schedule_expired().await.unwrap();
        let scheduled = storage.instance(instance.id).await.unwrap().unwrap();

        service
            .handle_termination_scheduled(&TerminationScheduledData {
                instance_id: instance.id,
                provider_instance_id: scheduled.provider_instance_id.clone(),
            })
            .await
            .unwrap();

        let terminated = storage.instance(instance.id).await.unwrap().unwrap();
        assert!(terminated.terminated_at.is_some());
        assert!(terminated.termination_scheduled_at.is_some());
        assert!(terminated.termination_scheduled_at <= terminated.terminated_at);

        let staged = storage.fetch_unpublished(10).await.unwrap();
        let topics: Vec<Topic> = staged.iter().map(|m| m.topic).collect();
        assert!(topics.contains(&Topic::TerminationScheduled));
        assert!(topics.contains(&Topic::InstanceTerminated));
    }

    #[tokio::test]
    async fn redelivered_termination_is_noop() {
        let (service, storage, _) = setup();
        let instance = seed_expired_instance(&storage).await;
        let data = TerminationScheduledData {
            instance_id: instance.id,
            provider_instance_id: instance.provider_instance_id.clone(),
        };

        service.handle_termination_scheduled(&data).await.unwrap();
        let messages_after_first = storage.message_count();

        service.handle_termination_scheduled(&data).await.unwrap();
        assert_eq!(storage.message_count(), messages_after_first);
    }

    #[tokio::test]
    async fn failed_teardown_rolls_back() {
        let (service, storage, provisioner) = setup();
        let instance = seed_expired_instance(&storage).await;
        provisioner.set_fail_on_terminate(true);

        let err = service
            .handle_termination_scheduled(&TerminationScheduledData {
                instance_id: instance.id,
                provider_instance_id: instance.provider_instance_id.clone(),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let unchanged = storage.instance(instance.id).await.unwrap().unwrap();
        assert!(unchanged.terminated_at.is_none());
        assert_eq!(storage.message_count(), 0);
    }

    #[tokio::test]
    async fn termination_of_unknown_instance_errors() {
        let (service, _, _) = setup();

        let err = service
            .handle_termination_scheduled(&TerminationScheduledData {
                instance_id: InstanceId::new(),
                provider_instance_id: "i-missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn scheduler_schedules_expired_rows_once() {
        let (service, storage, _) = setup();
        let instance = seed_expired_instance(&storage).await;

        assert_eq!(service.schedule_expired().await.unwrap(), 1);

        let scheduled = storage.instance(instance.id).await.unwrap().unwrap();
        assert!(scheduled.termination_scheduled_at.is_some());

        // A second pass finds nothing left to schedule.
        assert_eq!(service.schedule_expired().await.unwrap(), 0);
        let staged = storage.fetch_unpublished(10).await.unwrap();
        assert_eq!(
            staged
                .iter()
                .filter(|m| m.topic == Topic::TerminationScheduled)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn scheduler_ignores_live_instances() {
        let (service, storage, _) = setup();

        let live = ProvisionedInstance::new(ResourceId::new(), "i-live", 10);
        let mut tx = storage.begin().await.unwrap();
        storage.insert_instance(&mut tx, &live).await.unwrap();
        storage.commit(tx).await.unwrap();

        assert_eq!(service.schedule_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_scheduler_passes_do_not_double_schedule() {
        let (service, storage, _) = setup();
        for _ in 0..5 {
            seed_expired_instance(&storage).await;
        }

        let service = std::sync::Arc::new(service);
        let a = tokio::spawn({
            let service = std::sync::Arc::clone(&service);
            async move { service.schedule_expired().await.unwrap() }
        });
        let b = tokio::spawn({
            let service = std::sync::Arc::clone(&service);
            async move { service.schedule_expired().await.unwrap() }
        });

        let (scheduled_a, scheduled_b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(scheduled_a + scheduled_b, 5);

        let staged = storage.fetch_unpublished(50).await.unwrap();
        assert_eq!(
            staged
                .iter()
                .filter(|m| m.topic == Topic::TerminationScheduled)
                .count(),
            5
        );
    }

    #[tokio::test]
    async fn instance_details_combines_record_and_provider() {
        let (service, storage, provisioner) = setup();
        let resource_id = ResourceId::new();
        let provider_id = provisioner.provision(resource_id).await.unwrap();

        let instance = ProvisionedInstance::new(resource_id, &provider_id, 3);
        let mut tx = storage.begin().await.unwrap();
        storage.insert_instance(&mut tx, &instance).await.unwrap();
        storage.commit(tx).await.unwrap();

        let info = service.instance_details(instance.id).await.unwrap();
        assert!(info.admin_url.contains(&provider_id));
        assert_eq!(info.expires_at, instance.expires_at);
    }
}
