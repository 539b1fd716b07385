//! Persistence interfaces consumed by the delivery engine.
//!
//! The engine only ever talks to storage through these traits. The durable
//! store is the single source of truth for deliveries across restarts; the
//! subscriber directory is owned by whatever manages subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{
        DeliveryAttempt, DeliveryId, DeliveryRecord, FilterId, Subscriber, SubscriberFilter,
        SubscriberId,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Durable delivery bookkeeping.
#[async_trait]
pub trait DeliveryStore: Send + Sync + std::fmt::Debug + 'static {
    /// Inserts or replaces the record keyed by `record.id`.
    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    /// Fetches a delivery record.
    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>>;

    /// Deliveries with `success = false`, `attempts < max_attempts` and
    /// `next_retry <= now`, oldest due first, at most `limit` of them.
    async fn query_due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>>;

    /// Appends an immutable attempt row.
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// All attempts of one delivery ordered by attempt number.
    async fn list_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>>;
}

/// Read access to subscriber configuration.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync + std::fmt::Debug + 'static {
    /// Every subscriber with `active = true`.
    async fn list_active_subscribers(&self) -> Result<Vec<Subscriber>>;

    /// Looks up one subscriber regardless of its active flag.
    async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>>;
}

/// Persistence for subscriber filters.
#[async_trait]
pub trait FilterStore: Send + Sync + std::fmt::Debug + 'static {
    /// Inserts or replaces a filter.
    async fn save_filter(&self, filter: &SubscriberFilter) -> Result<()>;

    /// Fetches a filter.
    async fn get_filter(&self, id: FilterId) -> Result<Option<SubscriberFilter>>;

    /// Deletes a filter, returning whether it existed.
    async fn delete_filter(&self, id: FilterId) -> Result<bool>;

    /// Filters of one subscriber ordered by priority, then creation time.
    async fn list_filters(&self, subscriber_id: SubscriberId) -> Result<Vec<SubscriberFilter>>;
}
