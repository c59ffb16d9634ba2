//! Consumer-side deduplication of redelivered messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::Result;

/// Default retention window for seen fingerprints.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Checks whether a message fingerprint has been processed recently.
///
/// `seen_or_mark` is a single atomic check-and-set: the first call for a
/// fingerprint marks it and returns false, later calls within the
/// retention window return true. A hit means "already processed, skip with
/// success". Retention is bounded, so the guard is only correct while bus
/// redelivery latency stays under the window; handlers must additionally
/// tolerate re-application against an already-transitioned record.
#[async_trait]
pub trait DedupGuard: Send + Sync {
    /// Atomically checks and marks the fingerprint. Returns true if a live
    /// mark already existed.
    async fn seen_or_mark(&self, fingerprint: &str) -> Result<bool>;

    /// Removes a mark. Handlers call this after failing partway through,
    /// so the redelivered message is not mistaken for already-processed
    /// work.
    async fn forget(&self, fingerprint: &str) -> Result<()>;
}

/// In-memory dedup guard with TTL-based expiry.
///
/// Expired entries are pruned lazily on access, matching an LRU cache
/// keyspace with a default expiry.
#[derive(Clone)]
pub struct InMemoryDedupGuard {
    retention: Duration,
    seen: Arc<Mutex<HashMap<String, Instant>>>,
}

impl InMemoryDedupGuard {
    /// Creates a guard with the default 10-minute retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Creates a guard with a custom retention window.
    ///
    /// Size the window to exceed the maximum plausible redelivery delay of
    /// the bus in use.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the number of live (unexpired) marks.
    pub fn live_marks(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("dedup guard poisoned");
        seen.retain(|_, marked_at| now.duration_since(*marked_at) < self.retention);
        seen.len()
    }
}

impl Default for InMemoryDedupGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupGuard for InMemoryDedupGuard {
    async fn seen_or_mark(&self, fingerprint: &str) -> Result<bool> {
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("dedup guard poisoned");
        seen.retain(|_, marked_at| now.duration_since(*marked_at) < self.retention);

        if seen.contains_key(fingerprint) {
            return Ok(true);
        }
        seen.insert(fingerprint.to_string(), now);
        Ok(false)
    }

    async fn forget(&self, fingerprint: &str) -> Result<()> {
        let mut seen = self.seen.lock().expect("dedup guard poisoned");
        seen.remove(fingerprint);
        Ok(())
    }
}
