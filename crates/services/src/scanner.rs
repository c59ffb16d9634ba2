//! Periodic expiry scanner task.

use std::sync::Arc;
use std::time::Duration;

use bus::DedupGuard;
use store::Storage;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::provisioning::ProvisioningService;
use crate::services::provisioner::Provisioner;

const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runs [`ProvisioningService::schedule_expired`] on a fixed schedule.
///
/// Purely time-driven: it needs no triggering event, and overlapping runs
/// (or replicas on other service instances) are safe because the batch
/// query claims rows lock-or-skip.
pub struct ExpiryScanner<S, P, D> {
    service: Arc<ProvisioningService<S, P, D>>,
    interval: Duration,
}

/// Handle for a running scanner task.
pub struct ScannerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScannerHandle {
    /// Signals the scanner to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl<S, P, D> ExpiryScanner<S, P, D>
where
    S: Storage + 'static,
    P: Provisioner + 'static,
    D: DedupGuard + 'static,
{
    /// Creates a scanner with the default 5-minute interval.
    pub fn new(service: Arc<ProvisioningService<S, P, D>>) -> Self {
        Self {
            service,
            interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    /// Sets the scan interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawns the scan loop as a background task.
    pub fn spawn(self) -> ScannerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                "expiry scanner started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.service.schedule_expired().await {
                            tracing::warn!(error = %e, "expiry scan failed, will retry");
                        }
                    }
                }
            }

            tracing::info!("expiry scanner stopped");
        });

        ScannerHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provisioner::InMemoryProvisioner;
    use bus::InMemoryDedupGuard;
    use chrono::Utc;
    use common::ResourceId;
    use lifecycle::ProvisionedInstance;
    use store::MemoryStorage;
    use tokio::time::timeout;

    #[tokio::test]
    async fn scanner_picks_up_expired_instances() {
        let storage = MemoryStorage::new();
        let mut instance = ProvisionedInstance::new(ResourceId::new(), "i-00000001", 1);
        instance.expires_at = Utc::now() - chrono::Duration::minutes(1);

        let mut tx = storage.begin().await.unwrap();
        storage.insert_instance(&mut tx, &instance).await.unwrap();
        storage.commit(tx).await.unwrap();

        let service = Arc::new(ProvisioningService::new(
            storage.clone(),
            InMemoryProvisioner::new(),
            InMemoryDedupGuard::new(),
        ));
        let handle = ExpiryScanner::new(service)
            .with_interval(Duration::from_millis(10))
            .spawn();

        timeout(Duration::from_secs(2), async {
            loop {
                let current = storage.instance(instance.id).await.unwrap().unwrap();
                if current.termination_scheduled_at.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scanner never scheduled the instance");

        handle.shutdown().await;
    }
}
