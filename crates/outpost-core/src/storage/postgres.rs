//! PostgreSQL implementation of the storage traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, FromRow, PgPool, Row};
use tracing::{debug, info};

use super::{DeliveryStore, FilterStore, SubscriberDirectory};
use crate::{
    error::Result,
    models::{
        DeliveryAttempt, DeliveryId, DeliveryRecord, FilterGroup, FilterId, Subscriber,
        SubscriberFilter, SubscriberId,
    },
};

/// Idempotent schema statements applied by [`PostgresStore::migrate`].
pub const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS subscribers (
        id UUID PRIMARY KEY,
        url TEXT NOT NULL,
        secret TEXT,
        event_types TEXT[] NOT NULL DEFAULT '{}',
        active BOOLEAN NOT NULL DEFAULT TRUE,
        content_type TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS deliveries (
        id UUID PRIMARY KEY,
        subscriber_id UUID NOT NULL,
        event_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        url TEXT NOT NULL,
        payload BYTEA NOT NULL,
        content_type TEXT NOT NULL,
        status_code INTEGER NOT NULL DEFAULT 0,
        success BOOLEAN NOT NULL DEFAULT FALSE,
        error TEXT,
        duration_ms BIGINT NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_retry TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_deliveries_due
        ON deliveries (next_retry)
        WHERE success = FALSE AND next_retry IS NOT NULL
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_attempts (
        delivery_id UUID NOT NULL,
        subscriber_id UUID NOT NULL,
        attempt_number INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        url TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        success BOOLEAN NOT NULL,
        error TEXT,
        duration_ms BIGINT NOT NULL,
        next_retry TIMESTAMPTZ,
        attempted_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (delivery_id, attempt_number)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS subscriber_filters (
        id UUID PRIMARY KEY,
        subscriber_id UUID NOT NULL,
        name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        filter_group JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
];

/// Store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates missing tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = MIGRATIONS.len(), "schema migrations applied");
        Ok(())
    }

    /// Inserts or replaces a subscriber.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO subscribers (id, url, secret, event_types, active, content_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                event_types = EXCLUDED.event_types,
                active = EXCLUDED.active,
                content_type = EXCLUDED.content_type
            ",
        )
        .bind(subscriber.id.0)
        .bind(&subscriber.url)
        .bind(&subscriber.secret)
        .bind(&subscriber.event_types)
        .bind(subscriber.active)
        .bind(&subscriber.content_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn column_u16(row: &PgRow, column: &str) -> sqlx::Result<u16> {
    narrow(column, row.try_get::<i32, _>(column)?)
}

fn column_u32(row: &PgRow, column: &str) -> sqlx::Result<u32> {
    narrow(column, row.try_get::<i32, _>(column)?)
}

fn column_u64(row: &PgRow, column: &str) -> sqlx::Result<u64> {
    narrow(column, row.try_get::<i64, _>(column)?)
}

fn narrow<S, T>(column: &str, value: S) -> sqlx::Result<T>
where
    T: TryFrom<S>,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    T::try_from(value).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

impl<'r> FromRow<'r, PgRow> for Subscriber {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: SubscriberId(row.try_get("id")?),
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            event_types: row.try_get("event_types")?,
            active: row.try_get("active")?,
            content_type: row.try_get("content_type")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: DeliveryId(row.try_get("id")?),
            subscriber_id: SubscriberId(row.try_get("subscriber_id")?),
            event_id: row.try_get::<uuid::Uuid, _>("event_id")?.into(),
            event_type: row.try_get("event_type")?,
            url: row.try_get("url")?,
            payload: row.try_get("payload")?,
            content_type: row.try_get("content_type")?,
            status_code: column_u16(row, "status_code")?,
            success: row.try_get("success")?,
            error: row.try_get("error")?,
            duration_ms: column_u64(row, "duration_ms")?,
            attempts: column_u32(row, "attempts")?,
            next_retry: row.try_get("next_retry")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            delivery_id: DeliveryId(row.try_get("delivery_id")?),
            subscriber_id: SubscriberId(row.try_get("subscriber_id")?),
            attempt_number: column_u32(row, "attempt_number")?,
            event_type: row.try_get("event_type")?,
            url: row.try_get("url")?,
            status_code: column_u16(row, "status_code")?,
            success: row.try_get("success")?,
            error: row.try_get("error")?,
            duration_ms: column_u64(row, "duration_ms")?,
            next_retry: row.try_get("next_retry")?,
            attempted_at: row.try_get("attempted_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for SubscriberFilter {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let Json(group): Json<FilterGroup> = row.try_get("filter_group")?;
        Ok(Self {
            id: FilterId(row.try_get("id")?),
            subscriber_id: SubscriberId(row.try_get("subscriber_id")?),
            name: row.try_get("name")?,
            priority: row.try_get("priority")?,
            active: row.try_get("active")?,
            group,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO deliveries (
                id, subscriber_id, event_id, event_type, url, payload, content_type,
                status_code, success, error, duration_ms, attempts, next_retry,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                status_code = EXCLUDED.status_code,
                success = EXCLUDED.success,
                error = EXCLUDED.error,
                duration_ms = EXCLUDED.duration_ms,
                attempts = EXCLUDED.attempts,
                next_retry = EXCLUDED.next_retry,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(record.id.0)
        .bind(record.subscriber_id.0)
        .bind(record.event_id.0)
        .bind(&record.event_type)
        .bind(&record.url)
        .bind(&record.payload)
        .bind(&record.content_type)
        .bind(i32::from(record.status_code))
        .bind(record.success)
        .bind(&record.error)
        .bind(to_i64(record.duration_ms))
        .bind(to_i32(record.attempts))
        .bind(record.next_retry)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>("SELECT * FROM deliveries WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn query_due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT * FROM deliveries
            WHERE success = FALSE
              AND attempts < $2
              AND next_retry IS NOT NULL
              AND next_retry <= $1
            ORDER BY next_retry ASC
            LIMIT $3
            ",
        )
        .bind(now)
        .bind(to_i32(max_attempts))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        debug!(count = records.len(), "queried due retries");
        Ok(records)
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                delivery_id, subscriber_id, attempt_number, event_type, url,
                status_code, success, error, duration_ms, next_retry, attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (delivery_id, attempt_number) DO NOTHING
            ",
        )
        .bind(attempt.delivery_id.0)
        .bind(attempt.subscriber_id.0)
        .bind(to_i32(attempt.attempt_number))
        .bind(&attempt.event_type)
        .bind(&attempt.url)
        .bind(i32::from(attempt.status_code))
        .bind(attempt.success)
        .bind(&attempt.error)
        .bind(to_i64(attempt.duration_ms))
        .bind(attempt.next_retry)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT * FROM delivery_attempts WHERE delivery_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(delivery_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }
}

#[async_trait]
impl SubscriberDirectory for PostgresStore {
    async fn list_active_subscribers(&self) -> Result<Vec<Subscriber>> {
        let subscribers =
            sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE active = TRUE")
                .fetch_all(&self.pool)
                .await?;
        Ok(subscribers)
    }

    async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>> {
        let subscriber = sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(subscriber)
    }
}

#[async_trait]
impl FilterStore for PostgresStore {
    async fn save_filter(&self, filter: &SubscriberFilter) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO subscriber_filters (
                id, subscriber_id, name, priority, active, filter_group, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                priority = EXCLUDED.priority,
                active = EXCLUDED.active,
                filter_group = EXCLUDED.filter_group,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(filter.id.0)
        .bind(filter.subscriber_id.0)
        .bind(&filter.name)
        .bind(filter.priority)
        .bind(filter.active)
        .bind(Json(&filter.group))
        .bind(filter.created_at)
        .bind(filter.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_filter(&self, id: FilterId) -> Result<Option<SubscriberFilter>> {
        let filter =
            sqlx::query_as::<_, SubscriberFilter>("SELECT * FROM subscriber_filters WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(filter)
    }

    async fn delete_filter(&self, id: FilterId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriber_filters WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_filters(&self, subscriber_id: SubscriberId) -> Result<Vec<SubscriberFilter>> {
        let filters = sqlx::query_as::<_, SubscriberFilter>(
            r"
            SELECT * FROM subscriber_filters
            WHERE subscriber_id = $1
            ORDER BY priority ASC, created_at ASC
            ",
        )
        .bind(subscriber_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(filters)
    }
}
