//! Validating front for filter persistence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use outpost_core::{
    CoreError, FilterGroup, FilterId, FilterStore, SubscriberFilter, SubscriberId,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{subscriber_accepts, validate};
use crate::error::{DeliveryError, Result};

/// Partial update of a stored filter. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct FilterUpdate {
    /// New name.
    pub name: Option<String>,
    /// New priority.
    pub priority: Option<i32>,
    /// New active flag.
    pub active: Option<bool>,
    /// New rule tree.
    pub group: Option<FilterGroup>,
}

/// Wraps a [`FilterStore`] and refuses to persist invalid filters.
///
/// Reads pass straight through. Implements [`FilterStore`] itself so it can
/// stand in wherever a store is expected.
#[derive(Clone)]
pub struct FilterService {
    store: Arc<dyn FilterStore>,
}

impl std::fmt::Debug for FilterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterService").finish_non_exhaustive()
    }
}

fn check_filter(filter: &SubscriberFilter) -> Result<()> {
    if filter.name.trim().is_empty() {
        return Err(DeliveryError::invalid_filter("name", "name must not be empty"));
    }
    if filter.priority < 0 {
        return Err(DeliveryError::invalid_filter("priority", "priority must not be negative"));
    }
    validate(&filter.group)
}

impl FilterService {
    /// Creates a service over `store`.
    pub fn new(store: Arc<dyn FilterStore>) -> Self {
        Self { store }
    }

    /// Validates and stores a new active filter.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidFilter`] for an invalid filter, or a
    /// database error if the store fails.
    pub async fn create_filter(
        &self,
        subscriber_id: SubscriberId,
        name: impl Into<String>,
        priority: i32,
        group: FilterGroup,
    ) -> Result<SubscriberFilter> {
        let mut filter = SubscriberFilter::new(subscriber_id, name, group);
        filter.priority = priority;
        check_filter(&filter)?;
        self.store.save_filter(&filter).await?;

        info!(
            subscriber_id = %subscriber_id,
            filter_id = %filter.id,
            name = %filter.name,
            "filter created"
        );
        Ok(filter)
    }

    /// Applies `update` to an existing filter after validating the result.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] if the filter does not exist.
    pub async fn update_filter(&self, id: FilterId, update: FilterUpdate) -> Result<SubscriberFilter> {
        let mut filter = self
            .store
            .get_filter(id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("filter {id}")))?;

        if let Some(name) = update.name {
            filter.name = name;
        }
        if let Some(priority) = update.priority {
            filter.priority = priority;
        }
        if let Some(active) = update.active {
            filter.active = active;
        }
        if let Some(group) = update.group {
            filter.group = group;
        }
        filter.updated_at = Utc::now();

        check_filter(&filter)?;
        self.store.save_filter(&filter).await?;

        debug!(filter_id = %id, "filter updated");
        Ok(filter)
    }

    /// Deletes a filter.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] if the filter does not exist.
    pub async fn remove_filter(&self, id: FilterId) -> Result<()> {
        if self.store.delete_filter(id).await? {
            debug!(filter_id = %id, "filter deleted");
            Ok(())
        } else {
            Err(DeliveryError::not_found(format!("filter {id}")))
        }
    }

    /// Filters of one subscriber, lowest priority first.
    ///
    /// # Errors
    ///
    /// Returns a database error if the store fails.
    pub async fn filters_for(&self, subscriber_id: SubscriberId) -> Result<Vec<SubscriberFilter>> {
        Ok(self.store.list_filters(subscriber_id).await?)
    }

    /// Whether a subscriber's filters admit the event document.
    ///
    /// A store failure admits the event: losing a notification is worse than
    /// sending one the subscriber filtered out.
    pub async fn admits(&self, subscriber_id: SubscriberId, doc: &Map<String, Value>) -> bool {
        match self.store.list_filters(subscriber_id).await {
            Ok(filters) => subscriber_accepts(&filters, doc),
            Err(e) => {
                warn!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "filter lookup failed, delivering unfiltered"
                );
                true
            },
        }
    }
}

#[async_trait]
impl FilterStore for FilterService {
    async fn save_filter(&self, filter: &SubscriberFilter) -> outpost_core::Result<()> {
        check_filter(filter).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        self.store.save_filter(filter).await
    }

    async fn get_filter(&self, id: FilterId) -> outpost_core::Result<Option<SubscriberFilter>> {
        self.store.get_filter(id).await
    }

    async fn delete_filter(&self, id: FilterId) -> outpost_core::Result<bool> {
        self.store.delete_filter(id).await
    }

    async fn list_filters(
        &self,
        subscriber_id: SubscriberId,
    ) -> outpost_core::Result<Vec<SubscriberFilter>> {
        self.store.list_filters(subscriber_id).await
    }
}
