use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{InstanceId, ResourceId};
use lifecycle::{ProvisionedInstance, Resource};
use messages::Topic;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::outbox::{MessageId, OutboxMessage};
use crate::store::Storage;
use crate::{Result, StoreError};

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Creates a new PostgreSQL storage.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_resource(row: PgRow) -> Result<Resource> {
        Ok(Resource {
            id: ResourceId::from_uuid(row.try_get::<Uuid, _>("id")?),
            owner_contact: row.try_get("owner_contact")?,
            hours_reserved: row.try_get::<i32, _>("hours_reserved")? as u32,
            payment_ref: row.try_get("payment_ref")?,
            payment_received_at: row.try_get("payment_received_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_instance(row: PgRow) -> Result<ProvisionedInstance> {
        Ok(ProvisionedInstance {
            id: InstanceId::from_uuid(row.try_get::<Uuid, _>("id")?),
            resource_id: ResourceId::from_uuid(row.try_get::<Uuid, _>("resource_id")?),
            provider_instance_id: row.try_get("provider_instance_id")?,
            expires_at: row.try_get("expires_at")?,
            termination_scheduled_at: row.try_get("termination_scheduled_at")?,
            terminated_at: row.try_get("terminated_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        let topic_name: String = row.try_get("topic")?;
        let topic = Topic::parse(&topic_name).ok_or_else(|| StoreError::CorruptRow {
            table: "outbox_message",
            detail: format!("unknown topic '{topic_name}'"),
        })?;

        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            topic,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        Ok(tx.rollback().await?)
    }

    async fn insert_resource(&self, tx: &mut Self::Tx, resource: &Resource) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource (id, owner_contact, hours_reserved, payment_ref, payment_received_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(resource.id.as_uuid())
        .bind(&resource.owner_contact)
        .bind(resource.hours_reserved as i32)
        .bind(&resource.payment_ref)
        .bind(resource.payment_received_at)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn update_resource(&self, tx: &mut Self::Tx, resource: &Resource) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE resource
            SET owner_contact = $2, hours_reserved = $3, payment_ref = $4,
                payment_received_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(resource.id.as_uuid())
        .bind(&resource.owner_contact)
        .bind(resource.hours_reserved as i32)
        .bind(&resource.payment_ref)
        .bind(resource.payment_received_at)
        .bind(resource.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_contact, hours_reserved, payment_ref, payment_received_at, created_at, updated_at
            FROM resource
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_resource).transpose()
    }

    async fn resource_by_payment_ref(
        &self,
        tx: &mut Self::Tx,
        payment_ref: &str,
    ) -> Result<Option<Resource>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_contact, hours_reserved, payment_ref, payment_received_at, created_at, updated_at
            FROM resource
            WHERE payment_ref = $1
            FOR UPDATE
            "#,
        )
        .bind(payment_ref)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_resource).transpose()
    }

    async fn insert_instance(
        &self,
        tx: &mut Self::Tx,
        instance: &ProvisionedInstance,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provisioned_instance (id, resource_id, provider_instance_id, expires_at,
                termination_scheduled_at, terminated_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(instance.resource_id.as_uuid())
        .bind(&instance.provider_instance_id)
        .bind(instance.expires_at)
        .bind(instance.termination_scheduled_at)
        .bind(instance.terminated_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn update_instance(
        &self,
        tx: &mut Self::Tx,
        instance: &ProvisionedInstance,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioned_instance
            SET provider_instance_id = $2, expires_at = $3, termination_scheduled_at = $4,
                terminated_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(&instance.provider_instance_id)
        .bind(instance.expires_at)
        .bind(instance.termination_scheduled_at)
        .bind(instance.terminated_at)
        .bind(instance.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn instance(&self, id: InstanceId) -> Result<Option<ProvisionedInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_id, provider_instance_id, expires_at,
                termination_scheduled_at, terminated_at, created_at, updated_at
            FROM provisioned_instance
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn instance_for_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ProvisionedInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_id, provider_instance_id, expires_at,
                termination_scheduled_at, terminated_at, created_at, updated_at
            FROM provisioned_instance
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn instance_for_update(
        &self,
        tx: &mut Self::Tx,
        id: InstanceId,
    ) -> Result<Option<ProvisionedInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_id, provider_instance_id, expires_at,
                termination_scheduled_at, terminated_at, created_at, updated_at
            FROM provisioned_instance
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn expired_instances(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ProvisionedInstance>> {
        // SKIP LOCKED makes overlapping scans claim disjoint rows instead
        // of blocking on each other.
        let rows = sqlx::query(
            r#"
            SELECT id, resource_id, provider_instance_id, expires_at,
                termination_scheduled_at, terminated_at, created_at, updated_at
            FROM provisioned_instance
            WHERE termination_scheduled_at IS NULL
              AND terminated_at IS NULL
              AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }

    async fn stage(&self, tx: &mut Self::Tx, message: OutboxMessage) -> Result<MessageId> {
        sqlx::query(
            r#"
            INSERT INTO outbox_message (id, topic, payload, created_at, published_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.topic.as_str())
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.published_at)
        .execute(&mut **tx)
        .await?;

        Ok(message.id)
    }

    async fn fetch_unpublished(&self, limit: u32) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload, created_at, published_at
            FROM outbox_message
            WHERE published_at IS NULL
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn mark_published(&self, id: MessageId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_message
            SET published_at = $2
            WHERE id = $1 AND published_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
