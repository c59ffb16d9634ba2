use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{InstanceId, ResourceId};
use lifecycle::{ProvisionedInstance, Resource};

use crate::Result;
use crate::outbox::{MessageId, OutboxMessage};

/// Core trait for the lifecycle storage layer.
///
/// A `Storage` owns three concerns that must share one local transaction:
/// the resource rows, the provisioned-instance rows, and the outbox.
/// Coupling them behind a single transaction handle is what makes "state
/// mutated ⇒ event staged" atomic without a distributed transaction.
///
/// Methods taking `&mut Self::Tx` run inside an open transaction and only
/// take effect on [`commit`](Storage::commit); dropping the transaction
/// discards every buffered write, including staged outbox messages.
/// Methods taking only `&self` read or mutate committed state and are used
/// by the relay and by read-only callers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Handle for an open local transaction.
    type Tx: Send;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Commits the transaction, making all buffered writes visible.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Rolls the transaction back explicitly. Dropping the handle has the
    /// same effect.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    // -- resources --

    /// Inserts a new resource row.
    async fn insert_resource(&self, tx: &mut Self::Tx, resource: &Resource) -> Result<()>;

    /// Updates an existing resource row.
    async fn update_resource(&self, tx: &mut Self::Tx, resource: &Resource) -> Result<()>;

    /// Loads a resource by ID from committed state.
    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>>;

    /// Loads a resource by its payment session reference, inside the
    /// transaction so the subsequent update sees a consistent row.
    async fn resource_by_payment_ref(
        &self,
        tx: &mut Self::Tx,
        payment_ref: &str,
    ) -> Result<Option<Resource>>;

    // -- provisioned instances --

    /// Inserts a new instance row.
    async fn insert_instance(&self, tx: &mut Self::Tx, instance: &ProvisionedInstance)
    -> Result<()>;

    /// Updates an existing instance row.
    async fn update_instance(&self, tx: &mut Self::Tx, instance: &ProvisionedInstance)
    -> Result<()>;

    /// Loads an instance by ID from committed state.
    async fn instance(&self, id: InstanceId) -> Result<Option<ProvisionedInstance>>;

    /// Loads the instance provisioned for a resource, if any.
    async fn instance_for_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ProvisionedInstance>>;

    /// Loads an instance by ID inside the transaction, taking the row lock
    /// for the read-then-update step.
    async fn instance_for_update(
        &self,
        tx: &mut Self::Tx,
        id: InstanceId,
    ) -> Result<Option<ProvisionedInstance>>;

    /// Selects up to `limit` expired, not-yet-scheduled instances, oldest
    /// expiry first, claiming each row with a lock-or-skip lock.
    ///
    /// Rows already claimed by a concurrent transaction are skipped, not
    /// waited on; they stay eligible for the next scan. Claims are released
    /// on commit or rollback.
    async fn expired_instances(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ProvisionedInstance>>;

    // -- outbox --

    /// Stages a message for publishing. Must be called with an open
    /// transaction: the message becomes visible to
    /// [`fetch_unpublished`](Storage::fetch_unpublished) only after the
    /// enclosing transaction commits.
    async fn stage(&self, tx: &mut Self::Tx, message: OutboxMessage) -> Result<MessageId>;

    /// Returns up to `limit` committed, unpublished messages, oldest
    /// first. Used only by the relay.
    async fn fetch_unpublished(&self, limit: u32) -> Result<Vec<OutboxMessage>>;

    /// Marks a message as published. Idempotent: marking a message twice,
    /// or marking an unknown ID, is a no-op.
    async fn mark_published(&self, id: MessageId) -> Result<()>;
}
