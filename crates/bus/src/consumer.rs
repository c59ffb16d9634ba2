//! Generic consumer loop with bounded redelivery.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::Subscription;

/// Redelivery policy for a consumer group.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// How many times a failed delivery is put back on the queue before
    /// being dropped.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

/// Handle for a running consumer task.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Signals the consumer to stop and waits for it to exit. The delivery
    /// being handled when the signal arrives is finished first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawns a consumer task that feeds each delivery to `handler`.
///
/// A failed delivery is redelivered (back of the group's queue, attempt
/// count incremented) until the retry policy is exhausted, at which point
/// it is dropped with an error log. This is the at-least-once contract:
/// the handler must tolerate seeing the same message more than once.
pub fn spawn_consumer<F, Fut, E>(
    mut subscription: Subscription,
    retry: RetryPolicy,
    handler: F,
) -> ConsumerHandle
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::fmt::Display + Send,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let topic = subscription.topic();
        let group = subscription.group().to_string();
        tracing::debug!(%topic, %group, "consumer started");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                delivery = subscription.recv() => {
                    let Some(delivery) = delivery else { break };

                    match handler(delivery.payload.clone()).await {
                        Ok(()) => {
                            metrics::counter!("bus_deliveries_handled").increment(1);
                        }
                        Err(e) if delivery.attempt < retry.max_retries => {
                            metrics::counter!("bus_deliveries_retried").increment(1);
                            tracing::warn!(
                                %topic, %group,
                                attempt = delivery.attempt,
                                error = %e,
                                "handler failed, redelivering"
                            );
                            // Brief pause so a persistently failing handler
                            // doesn't spin through its retries instantly.
                            tokio::time::sleep(Duration::from_millis(
                                10 * u64::from(delivery.attempt + 1),
                            ))
                            .await;
                            if subscription.redeliver(delivery).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            metrics::counter!("bus_deliveries_dropped").increment(1);
                            tracing::error!(
                                %topic, %group,
                                attempt = delivery.attempt,
                                error = %e,
                                "handler failed, retries exhausted, dropping delivery"
                            );
                        }
                    }
                }
            }
        }

        tracing::debug!(%topic, %group, "consumer stopped");
    });

    ConsumerHandle {
        shutdown: shutdown_tx,
        handle,
    }
}
