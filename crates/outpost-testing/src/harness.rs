//! A running delivery engine over an in-memory store and a mock endpoint.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use outpost_core::{
    DeliveryAttempt, DeliveryId, DeliveryRecord, DeliveryStore, MemoryStore, RealClock, Subscriber,
};
use outpost_delivery::{CircuitConfig, DeliveryEngine, EngineConfig};

use crate::{fixtures::SubscriberBuilder, http::MockServer};

/// How long the `wait_*` helpers poll before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Builder for [`EngineHarness`] with millisecond-scale retry delays.
pub struct HarnessBuilder {
    config: EngineConfig,
}

impl HarnessBuilder {
    /// Fast retries, a long scan interval, default breaker thresholds.
    pub fn new() -> Self {
        let mut config = EngineConfig::default();
        config.retry.initial_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(200);
        config.client.timeout = Duration::from_secs(2);
        config.scheduler.worker_count = 2;
        config.scheduler.scan_interval = Duration::from_secs(3600);
        config.dispatcher.worker_count = 4;
        config.shutdown_timeout = Duration::from_secs(5);
        Self { config }
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.retry.initial_delay = delay;
        self
    }

    /// Sets the breaker thresholds.
    #[must_use]
    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.timeout = timeout;
        self
    }

    /// Sets the retry queue capacity.
    #[must_use]
    pub fn retry_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.scheduler.queue_capacity = capacity;
        self
    }

    /// Applies arbitrary changes to the engine configuration.
    #[must_use]
    pub fn configure(mut self, change: impl FnOnce(&mut EngineConfig)) -> Self {
        change(&mut self.config);
        self
    }

    /// Builds the harness without starting the engine.
    pub async fn build(self) -> Result<EngineHarness> {
        let store = MemoryStore::new();
        self.build_with_store(store).await
    }

    /// Builds over an existing store, as after a restart.
    pub async fn build_with_store(self, store: MemoryStore) -> Result<EngineHarness> {
        let http = MockServer::start().await;
        let engine = DeliveryEngine::new(
            self.config,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(RealClock::new()),
        )
        .context("failed to build delivery engine")?;
        Ok(EngineHarness { store, http, engine })
    }

    /// Builds and starts the harness.
    pub async fn start(self) -> Result<EngineHarness> {
        let mut harness = self.build().await?;
        harness.engine.start().context("failed to start delivery engine")?;
        Ok(harness)
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A delivery engine wired to a [`MemoryStore`] and a [`MockServer`].
pub struct EngineHarness {
    /// Backing store for deliveries, subscribers and filters.
    pub store: MemoryStore,
    /// Subscriber endpoint.
    pub http: MockServer,
    /// Engine under test.
    pub engine: DeliveryEngine,
}

impl EngineHarness {
    /// Shorthand for [`HarnessBuilder::new`].
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// Registers an active subscriber posting to `path` on the mock server.
    pub async fn add_subscriber(&self, path: &str) -> Subscriber {
        self.register(SubscriberBuilder::new(self.http.endpoint(path)).build()).await
    }

    /// Registers an arbitrary subscriber.
    pub async fn register(&self, subscriber: Subscriber) -> Subscriber {
        self.store.upsert_subscriber(subscriber.clone()).await;
        subscriber
    }

    /// Polls until `delivery_id` has at least `count` attempts.
    pub async fn wait_for_attempts(&self, delivery_id: DeliveryId, count: usize) -> Vec<DeliveryAttempt> {
        let started = Instant::now();
        loop {
            let attempts = self.store.list_attempts(delivery_id).await.unwrap_or_default();
            if attempts.len() >= count || started.elapsed() >= DEFAULT_WAIT {
                return attempts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Polls until `delivery_id` is terminal.
    pub async fn wait_for_terminal(&self, delivery_id: DeliveryId) -> Option<DeliveryRecord> {
        let started = Instant::now();
        loop {
            let record = self.store.get_delivery(delivery_id).await.ok().flatten();
            match record {
                Some(record) if record.is_terminal() => return Some(record),
                other if started.elapsed() >= DEFAULT_WAIT => return other,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    /// Shuts the engine down.
    pub async fn shutdown(self) -> Result<()> {
        self.engine.shutdown().await.context("engine shutdown failed")
    }
}
