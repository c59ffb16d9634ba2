use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{InstanceId, ResourceId};
use lifecycle::{ProvisionedInstance, Resource};

use crate::outbox::{MessageId, OutboxMessage};
use crate::store::Storage;
use crate::Result;

#[derive(Default)]
struct State {
    resources: HashMap<ResourceId, Resource>,
    instances: HashMap<InstanceId, ProvisionedInstance>,
    outbox: Vec<OutboxMessage>,
    /// Instance rows claimed by an open transaction's expiry scan.
    row_locks: HashSet<InstanceId>,
}

/// In-memory storage implementation for testing.
///
/// Writes made through a [`MemoryTx`] are buffered and applied only on
/// commit, mirroring the visibility rules of the PostgreSQL
/// implementation: a dropped or rolled-back transaction leaves no trace,
/// staged outbox messages included. The expiry scan's lock-or-skip claims
/// are modeled with an explicit lock set held until the transaction ends.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

/// Buffered transaction handle for [`MemoryStorage`].
pub struct MemoryTx {
    state: Arc<Mutex<State>>,
    resources: HashMap<ResourceId, Resource>,
    instances: HashMap<InstanceId, ProvisionedInstance>,
    staged: Vec<OutboxMessage>,
    locks: Vec<InstanceId>,
    finished: bool,
}

impl MemoryTx {
    fn release_locks(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        // Runs from Drop as well, so never panic here.
        if let Ok(mut state) = self.state.lock() {
            for id in self.locks.drain(..) {
                state.row_locks.remove(&id);
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // An unfinished transaction rolls back: buffered writes are simply
        // dropped, claimed rows go back to the pool.
        if !self.finished {
            self.release_locks();
        }
    }
}

impl MemoryStorage {
    /// Creates a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of outbox messages, published or not.
    pub fn message_count(&self) -> usize {
        self.state.lock().expect("memory storage poisoned").outbox.len()
    }

    /// Returns the number of unpublished outbox messages.
    pub fn unpublished_count(&self) -> usize {
        self.state
            .lock()
            .expect("memory storage poisoned")
            .outbox
            .iter()
            .filter(|m| m.published_at.is_none())
            .count()
    }

    /// Clears all rows and locks.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("memory storage poisoned");
        state.resources.clear();
        state.instances.clear();
        state.outbox.clear();
        state.row_locks.clear();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        Ok(MemoryTx {
            state: Arc::clone(&self.state),
            resources: HashMap::new(),
            instances: HashMap::new(),
            staged: Vec::new(),
            locks: Vec::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut tx: MemoryTx) -> Result<()> {
        {
            let mut state = self.state.lock().expect("memory storage poisoned");
            for (id, resource) in tx.resources.drain() {
                state.resources.insert(id, resource);
            }
            for (id, instance) in tx.instances.drain() {
                state.instances.insert(id, instance);
            }
            state.outbox.append(&mut tx.staged);
        }
        tx.release_locks();
        tx.finished = true;
        Ok(())
    }

    async fn rollback(&self, mut tx: MemoryTx) -> Result<()> {
        tx.release_locks();
        tx.finished = true;
        Ok(())
    }

    async fn insert_resource(&self, tx: &mut MemoryTx, resource: &Resource) -> Result<()> {
        tx.resources.insert(resource.id, resource.clone());
        Ok(())
    }

    async fn update_resource(&self, tx: &mut MemoryTx, resource: &Resource) -> Result<()> {
        tx.resources.insert(resource.id, resource.clone());
        Ok(())
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>> {
        let state = self.state.lock().expect("memory storage poisoned");
        Ok(state.resources.get(&id).cloned())
    }

    async fn resource_by_payment_ref(
        &self,
        tx: &mut MemoryTx,
        payment_ref: &str,
    ) -> Result<Option<Resource>> {
        if let Some(resource) = tx.resources.values().find(|r| r.payment_ref == payment_ref) {
            return Ok(Some(resource.clone()));
        }
        let state = self.state.lock().expect("memory storage poisoned");
        Ok(state
            .resources
            .values()
            .find(|r| r.payment_ref == payment_ref)
            .cloned())
    }

    async fn insert_instance(
        &self,
        tx: &mut MemoryTx,
        instance: &ProvisionedInstance,
    ) -> Result<()> {
        tx.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update_instance(
        &self,
        tx: &mut MemoryTx,
        instance: &ProvisionedInstance,
    ) -> Result<()> {
        tx.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn instance(&self, id: InstanceId) -> Result<Option<ProvisionedInstance>> {
        let state = self.state.lock().expect("memory storage poisoned");
        Ok(state.instances.get(&id).cloned())
    }

    async fn instance_for_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ProvisionedInstance>> {
        let state = self.state.lock().expect("memory storage poisoned");
        Ok(state
            .instances
            .values()
            .find(|i| i.resource_id == resource_id)
            .cloned())
    }

    async fn instance_for_update(
        &self,
        tx: &mut MemoryTx,
        id: InstanceId,
    ) -> Result<Option<ProvisionedInstance>> {
        if let Some(instance) = tx.instances.get(&id) {
            return Ok(Some(instance.clone()));
        }
        let state = self.state.lock().expect("memory storage poisoned");
        Ok(state.instances.get(&id).cloned())
    }

    async fn expired_instances(
        &self,
        tx: &mut MemoryTx,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ProvisionedInstance>> {
        let mut state = self.state.lock().expect("memory storage poisoned");

        let mut expired: Vec<ProvisionedInstance> = state
            .instances
            .values()
            .filter(|i| {
                i.termination_scheduled_at.is_none()
                    && i.terminated_at.is_none()
                    && i.expires_at <= now
                    && !state.row_locks.contains(&i.id)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|i| i.expires_at);
        expired.truncate(limit as usize);

        for instance in &expired {
            state.row_locks.insert(instance.id);
            tx.locks.push(instance.id);
        }

        Ok(expired)
    }

    async fn stage(&self, tx: &mut MemoryTx, message: OutboxMessage) -> Result<MessageId> {
        let id = message.id;
        tx.staged.push(message);
        Ok(id)
    }

    async fn fetch_unpublished(&self, limit: u32) -> Result<Vec<OutboxMessage>> {
        let state = self.state.lock().expect("memory storage poisoned");
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.published_at.is_none())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: MessageId) -> Result<()> {
        let mut state = self.state.lock().expect("memory storage poisoned");
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == id)
            && message.published_at.is_none()
        {
            message.published_at = Some(Utc::now());
        }
        Ok(())
    }
}
