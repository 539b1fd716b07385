//! Delivery engine facade.
//!
//! Wires the filter service, rate limiter, circuit breakers, delivery client,
//! retry scheduler and dispatcher around caller-supplied stores, and exposes
//! the operator operations.
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ dispatch() │──▶│ Dispatcher │──▶│ Outcome      │──▶│ Subscriber  │
//! └────────────┘   │ workers    │   │ recorder     │   │ endpoints   │
//!                  └────────────┘   └──────────────┘   └─────────────┘
//!                        │                 ▲
//!                        ▼                 │
//!                  ┌────────────┐   ┌──────────────┐
//!                  │ Retry      │──▶│ Retry        │
//!                  │ scheduler  │   │ workers      │
//!                  └────────────┘   └──────────────┘
//!                        ▲
//!                  ┌────────────┐
//!                  │ Store scan │
//!                  └────────────┘
//! ```

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use outpost_core::{
    Clock, DeliveryAttempt, DeliveryId, DeliveryRecord, DeliveryStore, Event, FilterGroup,
    FilterId, FilterStore, SubscriberDirectory, SubscriberFilter, SubscriberId,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    circuit::{CircuitBreakerManager, CircuitConfig, CircuitSnapshot, CircuitState},
    client::{ClientConfig, DeliveryClient},
    dispatcher::{DispatchReport, Dispatcher, DispatcherConfig},
    error::{DeliveryError, Result},
    filter::{self, FilterService, FilterTestResult, FilterUpdate},
    metrics::{MetricsAggregator, SubscriberMetrics},
    rate_limit::{RateLimit, RateLimiterRegistry},
    recorder::OutcomeRecorder,
    retry::RetryPolicy,
    scheduler::{RetryScheduler, SchedulerConfig},
    worker_pool::WorkerPool,
};

/// Configuration for the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,
    /// HTTP client settings.
    pub client: ClientConfig,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Retry workers and scanner.
    pub scheduler: SchedulerConfig,
    /// Dispatch workers.
    pub dispatcher: DispatcherConfig,
    /// Maximum time to wait for in-flight work at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig::default(),
            client: ClientConfig::default(),
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// Outbound event delivery engine.
#[derive(Debug)]
pub struct DeliveryEngine {
    config: EngineConfig,
    deliveries: Arc<dyn DeliveryStore>,
    filters: FilterService,
    limiter: Arc<RateLimiterRegistry>,
    circuits: Arc<CircuitBreakerManager>,
    metrics: Arc<MetricsAggregator>,
    scheduler: Arc<RetryScheduler>,
    dispatcher: Arc<Dispatcher>,
    cancellation_token: CancellationToken,
    pools: Option<Vec<WorkerPool>>,
}

impl DeliveryEngine {
    /// Builds an engine over the given stores.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] if the HTTP client cannot be
    /// built from `config.client`.
    pub fn new(
        config: EngineConfig,
        deliveries: Arc<dyn DeliveryStore>,
        subscribers: Arc<dyn SubscriberDirectory>,
        filters: Arc<dyn FilterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cancellation_token = CancellationToken::new();
        let client = Arc::new(DeliveryClient::new(config.client.clone())?);
        let circuits = Arc::new(CircuitBreakerManager::new(config.circuit.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiterRegistry::new(clock.clone()));
        let metrics = Arc::new(MetricsAggregator::new());
        let filters = FilterService::new(filters);

        let recorder = Arc::new(OutcomeRecorder::new(
            client,
            deliveries.clone(),
            circuits.clone(),
            metrics.clone(),
            config.retry.clone(),
            clock.clone(),
        ));
        let scheduler = RetryScheduler::new(
            config.scheduler.clone(),
            deliveries.clone(),
            subscribers.clone(),
            recorder.clone(),
            circuits.clone(),
            metrics.clone(),
            clock.clone(),
            cancellation_token.clone(),
        );
        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            subscribers,
            filters.clone(),
            limiter.clone(),
            circuits.clone(),
            metrics.clone(),
            recorder,
            scheduler.clone(),
            clock,
            cancellation_token.clone(),
        );

        Ok(Self {
            config,
            deliveries,
            filters,
            limiter,
            circuits,
            metrics,
            scheduler,
            dispatcher,
            cancellation_token,
            pools: None,
        })
    }

    /// Spawns the dispatch workers, retry workers and retry scanner.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Internal`] if the engine is already running,
    /// or [`DeliveryError::ShutdownRequested`] if it was shut down.
    pub fn start(&mut self) -> Result<()> {
        if self.pools.is_some() {
            return Err(DeliveryError::internal("delivery engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::ShutdownRequested);
        }

        info!(
            dispatch_workers = self.config.dispatcher.worker_count,
            retry_workers = self.config.scheduler.worker_count,
            max_attempts = self.config.retry.max_attempts,
            "starting delivery engine"
        );
        let retry_pool = self.scheduler.start();
        let dispatch_pool = self.dispatcher.start();
        self.pools = Some(vec![dispatch_pool, retry_pool]);
        info!("delivery engine started");
        Ok(())
    }

    /// Whether [`start`](Self::start) has run.
    pub fn is_running(&self) -> bool {
        self.pools.is_some() && !self.cancellation_token.is_cancelled()
    }

    /// Stops admitting work and waits for in-flight attempts to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if workers are still busy
    /// after `shutdown_timeout`, or [`DeliveryError::WorkerPanic`].
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        let Some(pools) = self.pools.take() else {
            info!("delivery engine was not started, shutdown completed immediately");
            return Ok(());
        };

        let mut first_error = None;
        for pool in pools {
            if let Err(e) = pool.shutdown_graceful(self.config.shutdown_timeout).await {
                warn!(error = %e, "worker pool did not shut down cleanly");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Token that cancels the engine when fired.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Delivers `event` to every interested subscriber and reports outcomes.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub async fn dispatch(&self, event: Event) -> Result<DispatchReport> {
        self.dispatcher.dispatch(event).await
    }

    /// Circuit state for a subscriber; untracked subscribers are closed.
    pub async fn circuit_state(&self, subscriber_id: SubscriberId) -> CircuitState {
        self.circuits.state(subscriber_id).await
    }

    /// Full breaker record for a subscriber, if tracked.
    pub async fn circuit_snapshot(&self, subscriber_id: SubscriberId) -> Option<CircuitSnapshot> {
        self.circuits.snapshot(subscriber_id).await
    }

    /// Every tracked breaker.
    pub async fn all_circuits(&self) -> HashMap<SubscriberId, CircuitSnapshot> {
        self.circuits.all_circuits().await
    }

    /// Forces a subscriber's circuit closed.
    pub async fn reset_circuit(&self, subscriber_id: SubscriberId) {
        self.circuits.reset(subscriber_id).await;
    }

    /// Replaces the breaker thresholds for all subscribers.
    pub async fn set_circuit_config(&self, config: CircuitConfig) {
        self.circuits.set_config(config).await;
    }

    /// Sets a subscriber's limit; zero or negative removes it.
    pub async fn set_rate_limit(&self, subscriber_id: SubscriberId, requests_per_minute: i64) {
        self.limiter.set_limit(subscriber_id, requests_per_minute).await;
    }

    /// Configured limit, if any.
    pub async fn rate_limit(&self, subscriber_id: SubscriberId) -> Option<RateLimit> {
        self.limiter.limit(subscriber_id).await
    }

    /// Tokens left, or [`crate::rate_limit::UNLIMITED`].
    pub async fn remaining_requests(&self, subscriber_id: SubscriberId) -> i64 {
        self.limiter.remaining(subscriber_id).await
    }

    /// Removes a subscriber's limit. Returns whether one existed.
    pub async fn remove_rate_limit(&self, subscriber_id: SubscriberId) -> bool {
        self.limiter.remove(subscriber_id).await
    }

    /// Forces an immediate retry of one delivery.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotStarted`] before [`start`](Self::start); otherwise
    /// see [`RetryScheduler::retry_now`]. [`DeliveryError::QueueFull`] means
    /// the caller may try again later.
    pub async fn retry_delivery(&self, delivery_id: DeliveryId) -> Result<()> {
        if self.pools.is_none() {
            return Err(DeliveryError::NotStarted);
        }
        self.scheduler.retry_now(delivery_id).await
    }

    /// Enqueues due retries from the store now instead of at the next tick.
    ///
    /// # Errors
    ///
    /// See [`RetryScheduler::scan_due_retries`].
    pub async fn scan_due_retries(&self) -> Result<usize> {
        if self.pools.is_none() {
            return Err(DeliveryError::NotStarted);
        }
        self.scheduler.scan_due_retries().await
    }

    /// Validates and stores a filter for a subscriber.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::InvalidFilter`] for an invalid rule tree.
    pub async fn create_filter(
        &self,
        subscriber_id: SubscriberId,
        name: impl Into<String>,
        priority: i32,
        group: FilterGroup,
    ) -> Result<SubscriberFilter> {
        self.filters.create_filter(subscriber_id, name, priority, group).await
    }

    /// Updates a stored filter.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotFound`] or [`DeliveryError::InvalidFilter`].
    pub async fn update_filter(&self, id: FilterId, update: FilterUpdate) -> Result<SubscriberFilter> {
        self.filters.update_filter(id, update).await
    }

    /// Deletes a stored filter.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotFound`] if it does not exist.
    pub async fn delete_filter(&self, id: FilterId) -> Result<()> {
        self.filters.remove_filter(id).await
    }

    /// A subscriber's filters, lowest priority first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_filters(&self, subscriber_id: SubscriberId) -> Result<Vec<SubscriberFilter>> {
        self.filters.filters_for(subscriber_id).await
    }

    /// Evaluates a candidate rule tree against a sample event without
    /// storing anything.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::InvalidFilter`] if `group` is invalid.
    pub fn test_filter(&self, group: &FilterGroup, event: &Event) -> Result<FilterTestResult> {
        filter::test_filter(group, event)
    }

    /// Metrics for one subscriber.
    pub async fn metrics(&self, subscriber_id: SubscriberId) -> Option<SubscriberMetrics> {
        self.metrics.snapshot(subscriber_id).await
    }

    /// Flat metrics map for one subscriber.
    pub async fn export_metrics(&self, subscriber_id: SubscriberId) -> BTreeMap<String, f64> {
        self.metrics.export(subscriber_id).await
    }

    /// Flat metrics maps for every subscriber.
    pub async fn export_all_metrics(&self) -> HashMap<SubscriberId, BTreeMap<String, f64>> {
        self.metrics.export_all().await
    }

    /// Clears one subscriber's metrics.
    pub async fn reset_metrics(&self, subscriber_id: SubscriberId) {
        self.metrics.reset(subscriber_id).await;
    }

    /// Current state of one delivery.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delivery(&self, delivery_id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        Ok(self.deliveries.get_delivery(delivery_id).await?)
    }

    /// Every attempt made for one delivery, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delivery_history(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.deliveries.list_attempts(delivery_id).await?)
    }

    /// Drops breaker, limiter and metrics state for a deleted subscriber.
    pub async fn forget_subscriber(&self, subscriber_id: SubscriberId) {
        self.circuits.remove(subscriber_id).await;
        self.limiter.remove(subscriber_id).await;
        self.metrics.remove(subscriber_id).await;
        info!(subscriber_id = %subscriber_id, "subscriber state forgotten");
    }
}
