//! Background relay from the outbox to the message bus.

use std::time::Duration;

use store::Storage;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Result;
use crate::bus::MessageBus;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_BATCH_SIZE: u32 = 50;

/// Polls the outbox and publishes committed messages to the bus.
///
/// The relay never re-runs business logic: it only moves already-committed
/// rows. A publish failure leaves the row unpublished and the pass stops,
/// so the next tick retries from the same point: at-least-once delivery
/// with unbounded retry, FIFO within the fetch order. Running several
/// relay instances against one store is safe: the worst case is a
/// duplicate publish, which consumers deduplicate.
pub struct Relay<S, B> {
    storage: S,
    bus: B,
    poll_interval: Duration,
    batch_size: u32,
}

/// Handle for a running relay task.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RelayHandle {
    /// Signals the relay to stop and waits for it to exit. One final
    /// publish pass runs first so in-flight messages drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl<S, B> Relay<S, B>
where
    S: Storage + 'static,
    B: MessageBus + 'static,
{
    /// Creates a relay with default polling settings.
    pub fn new(storage: S, bus: B) -> Self {
        Self {
            storage,
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how many messages one pass fetches.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Runs one publish pass: fetch unpublished messages oldest-first,
    /// publish each, mark it published. On a publish failure the pass
    /// stops; the failed message and everything behind it stay queued for
    /// the next pass, preserving per-topic order.
    ///
    /// Returns how many messages were published.
    pub async fn publish_pending(&self) -> Result<usize> {
        let messages = self.storage.fetch_unpublished(self.batch_size).await?;
        let mut published = 0;

        for message in messages {
            match self.bus.publish(message.topic, message.payload.clone()).await {
                Ok(()) => {
                    self.storage.mark_published(message.id).await?;
                    metrics::counter!("relay_published_total").increment(1);
                    published += 1;
                }
                Err(e) => {
                    metrics::counter!("relay_publish_failures_total").increment(1);
                    tracing::warn!(
                        message_id = %message.id,
                        topic = %message.topic,
                        error = %e,
                        "publish failed, leaving message for next pass"
                    );
                    break;
                }
            }
        }

        Ok(published)
    }

    /// Spawns the polling loop as a background task.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let relay = self;
            async move {
                tracing::info!(
                    poll_interval_ms = relay.poll_interval.as_millis() as u64,
                    batch_size = relay.batch_size,
                    "relay started"
                );

                let mut ticker = tokio::time::interval(relay.poll_interval);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = relay.publish_pending().await {
                                tracing::warn!(error = %e, "relay pass failed, will retry");
                            }
                        }
                    }
                }

                // Drain in-flight rows before exiting.
                if let Err(e) = relay.publish_pending().await {
                    tracing::warn!(error = %e, "final relay drain failed");
                }
                tracing::info!("relay stopped");
            }
        });

        RelayHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}
