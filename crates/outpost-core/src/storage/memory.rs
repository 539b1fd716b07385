//! In-memory storage used by tests and embedded deployments.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{DeliveryStore, FilterStore, SubscriberDirectory};
use crate::{
    error::{CoreError, Result},
    models::{
        DeliveryAttempt, DeliveryId, DeliveryRecord, FilterId, Subscriber, SubscriberFilter,
        SubscriberId,
    },
};

/// Store implementing every storage trait over process memory.
///
/// Clones share state. Failures can be injected per concern to exercise the
/// engine's degraded paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    deliveries: RwLock<HashMap<DeliveryId, DeliveryRecord>>,
    attempts: RwLock<Vec<DeliveryAttempt>>,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    filters: RwLock<HashMap<FilterId, SubscriberFilter>>,
    fail_writes: AtomicBool,
    fail_directory: AtomicBool,
    fail_filters: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a subscriber.
    pub async fn upsert_subscriber(&self, subscriber: Subscriber) {
        self.inner.subscribers.write().await.insert(subscriber.id, subscriber);
    }

    /// Removes a subscriber, returning it if present.
    pub async fn remove_subscriber(&self, id: SubscriberId) -> Option<Subscriber> {
        self.inner.subscribers.write().await.remove(&id)
    }

    /// Makes delivery writes fail until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes subscriber listing fail until cleared.
    pub fn fail_directory(&self, fail: bool) {
        self.inner.fail_directory.store(fail, Ordering::SeqCst);
    }

    /// Makes filter reads and writes fail until cleared.
    pub fn fail_filters(&self, fail: bool) {
        self.inner.fail_filters.store(fail, Ordering::SeqCst);
    }

    /// Every stored delivery record.
    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.inner.deliveries.read().await.values().cloned().collect()
    }

    /// Every recorded attempt in insertion order.
    pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.inner.attempts.read().await.clone()
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CoreError::Database(format!("{what} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        Self::check(&self.inner.fail_writes, "delivery store")?;
        self.inner.deliveries.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        Ok(self.inner.deliveries.read().await.get(&id).cloned())
    }

    async fn query_due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let deliveries = self.inner.deliveries.read().await;
        let mut due: Vec<DeliveryRecord> = deliveries
            .values()
            .filter(|r| !r.success && r.attempts < max_attempts)
            .filter(|r| r.next_retry.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry);
        due.truncate(limit);
        Ok(due)
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        Self::check(&self.inner.fail_writes, "delivery store")?;
        self.inner.attempts.write().await.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .inner
            .attempts
            .read()
            .await
            .iter()
            .filter(|a| a.delivery_id == delivery_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }
}

#[async_trait]
impl SubscriberDirectory for MemoryStore {
    async fn list_active_subscribers(&self) -> Result<Vec<Subscriber>> {
        Self::check(&self.inner.fail_directory, "subscriber directory")?;
        Ok(self.inner.subscribers.read().await.values().filter(|s| s.active).cloned().collect())
    }

    async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>> {
        Self::check(&self.inner.fail_directory, "subscriber directory")?;
        Ok(self.inner.subscribers.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl FilterStore for MemoryStore {
    async fn save_filter(&self, filter: &SubscriberFilter) -> Result<()> {
        Self::check(&self.inner.fail_filters, "filter store")?;
        self.inner.filters.write().await.insert(filter.id, filter.clone());
        Ok(())
    }

    async fn get_filter(&self, id: FilterId) -> Result<Option<SubscriberFilter>> {
        Self::check(&self.inner.fail_filters, "filter store")?;
        Ok(self.inner.filters.read().await.get(&id).cloned())
    }

    async fn delete_filter(&self, id: FilterId) -> Result<bool> {
        Self::check(&self.inner.fail_filters, "filter store")?;
        Ok(self.inner.filters.write().await.remove(&id).is_some())
    }

    async fn list_filters(&self, subscriber_id: SubscriberId) -> Result<Vec<SubscriberFilter>> {
        Self::check(&self.inner.fail_filters, "filter store")?;
        let mut filters: Vec<SubscriberFilter> = self
            .inner
            .filters
            .read()
            .await
            .values()
            .filter(|f| f.subscriber_id == subscriber_id)
            .cloned()
            .collect();
        filters.sort_by_key(|f| (f.priority, f.created_at));
        Ok(filters)
    }
}
