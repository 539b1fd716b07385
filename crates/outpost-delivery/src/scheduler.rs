//! Retry scheduling.
//!
//! Failed deliveries reach the retry workers two ways:
//!
//! - **Immediate**: the attempt that failed hands a [`RetryTask`] to
//!   [`RetryScheduler::schedule`], which waits until it is due and then
//!   offers it to the bounded queue. A full queue drops the task; the
//!   durable record still carries `next_retry`, so the scanner recovers it.
//! - **Periodic**: the scanner queries the store for due deliveries every
//!   `scan_interval` and enqueues them, waiting for queue room. This is what
//!   carries retries across restarts.
//!
//! A delivery id is held from the moment a task for it exists until its
//! attempt is recorded, so two attempts for one delivery never overlap. A
//! hold is either *waiting* for its due time, which a manual retry may
//! cancel and take over, or *active* once queued or running.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use outpost_core::{
    Clock, DeliveryId, DeliveryRecord, DeliveryStore, RetryTask, SubscriberDirectory,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::CircuitBreakerManager,
    error::{DeliveryError, Result},
    metrics::MetricsAggregator,
    recorder::OutcomeRecorder,
    worker_pool::{WorkQueue, WorkerPool},
};

/// Retry worker and scanner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent retry workers.
    pub worker_count: usize,
    /// Bounded queue size.
    pub queue_capacity: usize,
    /// Time between durable-store scans.
    pub scan_interval: Duration,
    /// Maximum deliveries picked up per scan.
    pub scan_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1000,
            scan_interval: Duration::from_secs(30),
            scan_batch_size: 100,
        }
    }
}

/// State of a held delivery.
#[derive(Debug)]
enum Hold {
    /// Sleeping until due; cancelling the token abandons the wait.
    Waiting(CancellationToken),
    /// Queued for a worker or being attempted.
    Active,
}

/// Re-attempts failed deliveries until success or budget exhaustion.
#[derive(Debug)]
pub struct RetryScheduler {
    config: SchedulerConfig,
    store: Arc<dyn DeliveryStore>,
    directory: Arc<dyn SubscriberDirectory>,
    recorder: Arc<OutcomeRecorder>,
    circuits: Arc<CircuitBreakerManager>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    queue: WorkQueue<RetryTask>,
    holds: Mutex<HashMap<DeliveryId, Hold>>,
    cancel: CancellationToken,
}

impl RetryScheduler {
    /// Creates a scheduler. Nothing runs until [`start`](Self::start).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn SubscriberDirectory>,
        recorder: Arc<OutcomeRecorder>,
        circuits: Arc<CircuitBreakerManager>,
        metrics: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let queue = WorkQueue::bounded(config.queue_capacity);
        Arc::new(Self {
            config,
            store,
            directory,
            recorder,
            circuits,
            metrics,
            clock,
            queue,
            holds: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Spawns the retry workers and the periodic scanner.
    pub fn start(self: &Arc<Self>) -> WorkerPool {
        let mut pool = WorkerPool::new("retry", self.cancel.clone());

        pool.spawn_workers(self.config.worker_count, |_| {
            let scheduler = Arc::clone(self);
            async move {
                while let Some(task) = scheduler.queue.pop(&scheduler.cancel).await {
                    scheduler.process(task).await;
                }
            }
        });

        let scheduler = Arc::clone(self);
        pool.spawn_task(async move { scheduler.run_scanner().await });

        info!(
            worker_count = self.config.worker_count,
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "retry scheduler started"
        );
        pool
    }

    /// Queues `task` for its due time unless its delivery is already held.
    pub async fn schedule(self: &Arc<Self>, task: RetryTask) {
        let token = {
            let mut holds = self.holds.lock().await;
            if holds.contains_key(&task.delivery_id) {
                debug!(delivery_id = %task.delivery_id, "retry already held, not scheduling");
                return;
            }
            let token = self.cancel.child_token();
            holds.insert(task.delivery_id, Hold::Waiting(token.clone()));
            token
        };
        self.spawn_delayed(task, token);
    }

    /// Moves a delivery this scheduler already holds back to waiting.
    async fn reschedule(self: &Arc<Self>, task: RetryTask) {
        let token = self.cancel.child_token();
        self.holds.lock().await.insert(task.delivery_id, Hold::Waiting(token.clone()));
        self.spawn_delayed(task, token);
    }

    /// Waits for `task.due_at`, then offers the task to the queue unless
    /// `token` was cancelled first.
    fn spawn_delayed(self: &Arc<Self>, task: RetryTask, token: CancellationToken) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let wait = (task.due_at - scheduler.clock.now_utc()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = scheduler.clock.sleep(wait) => {},
            }

            let delivery_id = task.delivery_id;
            {
                let mut holds = scheduler.holds.lock().await;
                if token.is_cancelled() {
                    return;
                }
                holds.insert(delivery_id, Hold::Active);
            }
            match scheduler.queue.try_push(task) {
                Ok(()) => debug!(delivery_id = %delivery_id, "retry enqueued"),
                Err(e) => {
                    warn!(
                        delivery_id = %delivery_id,
                        error = %e,
                        "retry dropped from immediate queue, left for scanner"
                    );
                    scheduler.release(delivery_id).await;
                },
            }
        });
    }

    /// Forces an immediate attempt of one delivery.
    ///
    /// Ignores the due time and, for this one attempt, the attempt budget. A
    /// retry waiting for its due time is cancelled and replaced.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::NotFound`] if the delivery or its subscriber is unknown
    /// - [`DeliveryError::AlreadyDelivered`] if it already succeeded
    /// - [`DeliveryError::RetryInProgress`] if an attempt is queued or running
    /// - [`DeliveryError::QueueFull`] if the queue has no room; try again later
    /// - [`DeliveryError::ShutdownRequested`] during shutdown
    pub async fn retry_now(&self, delivery_id: DeliveryId) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::ShutdownRequested);
        }
        let record = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("delivery {delivery_id}")))?;
        if record.success {
            return Err(DeliveryError::AlreadyDelivered { delivery_id: delivery_id.to_string() });
        }
        let subscriber = self
            .directory
            .get_subscriber(record.subscriber_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("subscriber {}", record.subscriber_id)))?;

        {
            let mut holds = self.holds.lock().await;
            match holds.get(&delivery_id) {
                Some(Hold::Active) => {
                    return Err(DeliveryError::RetryInProgress { delivery_id: delivery_id.to_string() });
                },
                Some(Hold::Waiting(token)) => {
                    token.cancel();
                    debug!(delivery_id = %delivery_id, "scheduled retry superseded by manual retry");
                },
                None => {},
            }
            holds.insert(delivery_id, Hold::Active);
        }

        let mut task = RetryTask::for_record(&record, &subscriber, self.clock.now_utc());
        task.forced = true;

        if let Err(e) = self.queue.try_push(task) {
            self.release(delivery_id).await;
            return Err(e);
        }
        info!(delivery_id = %delivery_id, attempt = record.attempts + 1, "manual retry enqueued");
        Ok(())
    }

    /// Enqueues every due delivery not already in flight.
    ///
    /// Waits for queue room. Deliveries whose subscriber no longer exists
    /// are marked terminal. Returns how many tasks were enqueued.
    ///
    /// # Errors
    ///
    /// Returns a database error if the due-retry query fails, or
    /// [`DeliveryError::ShutdownRequested`] if cancelled while waiting.
    pub async fn scan_due_retries(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let due = self
            .store
            .query_due_retries(now, self.recorder.policy().max_attempts, self.config.scan_batch_size)
            .await?;

        let mut enqueued = 0;
        for record in due {
            {
                let mut holds = self.holds.lock().await;
                if holds.contains_key(&record.id) {
                    continue;
                }
                holds.insert(record.id, Hold::Active);
            }
            let subscriber = match self.directory.get_subscriber(record.subscriber_id).await {
                Ok(Some(subscriber)) => subscriber,
                Ok(None) => {
                    self.abandon(record, "subscriber no longer exists", now).await;
                    continue;
                },
                Err(e) => {
                    warn!(delivery_id = %record.id, error = %e, "subscriber lookup failed during scan");
                    self.release(record.id).await;
                    continue;
                },
            };

            let task = RetryTask::for_record(&record, &subscriber, now);
            if let Err(e) = self.queue.push(task, &self.cancel).await {
                self.release(record.id).await;
                return Err(e);
            }
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, "due retries enqueued from store");
        }
        Ok(enqueued)
    }

    /// Whether `delivery_id` is waiting for its due time, queued or running.
    pub async fn is_in_flight(&self, delivery_id: DeliveryId) -> bool {
        self.holds.lock().await.contains_key(&delivery_id)
    }

    /// Whether an attempt for `delivery_id` is queued or running.
    pub async fn is_active(&self, delivery_id: DeliveryId) -> bool {
        matches!(self.holds.lock().await.get(&delivery_id), Some(Hold::Active))
    }

    async fn run_scanner(&self) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_due_retries().await {
                        if matches!(e, DeliveryError::ShutdownRequested) {
                            break;
                        }
                        error!(error = %e, "retry scan failed");
                    }
                },
            }
        }
        debug!("retry scanner stopped");
    }

    async fn process(self: &Arc<Self>, task: RetryTask) {
        let delivery_id = task.delivery_id;

        let mut record = match self.store.get_delivery(delivery_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(delivery_id = %delivery_id, "retry for unknown delivery dropped");
                self.release(delivery_id).await;
                return;
            },
            Err(e) => {
                error!(delivery_id = %delivery_id, error = %e, "failed to load delivery for retry");
                self.release(delivery_id).await;
                return;
            },
        };

        if !self.is_attemptable(&record, &task) {
            debug!(delivery_id = %delivery_id, "retry no longer applicable");
            self.release(delivery_id).await;
            return;
        }

        if !self.circuits.allow(record.subscriber_id).await {
            self.defer_for_circuit(record, task).await;
            return;
        }

        record.url.clone_from(&task.url);
        let recorded = self.recorder.attempt(&mut record, task.secret.as_deref()).await;

        if recorded.wants_retry() {
            if let Some(due_at) = recorded.next_retry {
                let next = RetryTask {
                    attempt: record.attempts + 1,
                    due_at,
                    forced: false,
                    ..task
                };
                self.reschedule(next).await;
                return;
            }
        }
        self.release(delivery_id).await;
    }

    fn is_attemptable(&self, record: &DeliveryRecord, task: &RetryTask) -> bool {
        if record.success {
            return false;
        }
        if task.forced {
            return true;
        }
        record.next_retry.is_some()
            && record.attempts < self.recorder.policy().max_attempts
            && record.attempts + 1 == task.attempt
    }

    /// Pushes a retry past an open circuit without spending an attempt.
    async fn defer_for_circuit(self: &Arc<Self>, mut record: DeliveryRecord, task: RetryTask) {
        let now = self.clock.now_utc();
        let fallback = chrono::Duration::from_std(self.recorder.policy().initial_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let due_at = self
            .circuits
            .next_eligible_at(record.subscriber_id)
            .await
            .filter(|at| *at > now)
            .unwrap_or(now + fallback);

        self.metrics.record_circuit_open(record.subscriber_id).await;
        record.next_retry = Some(due_at);
        record.updated_at = now;
        if let Err(e) = self.store.save_delivery(&record).await {
            error!(
                delivery_id = %record.id,
                error = %e,
                "durability gap: deferred retry not persisted"
            );
        }

        debug!(delivery_id = %record.id, next_retry = %due_at, "circuit open, retry deferred");
        self.reschedule(RetryTask { due_at, ..task }).await;
    }

    async fn abandon(&self, mut record: DeliveryRecord, reason: &str, now: DateTime<Utc>) {
        warn!(delivery_id = %record.id, reason, "abandoning retry");
        record.next_retry = None;
        record.error = Some(reason.to_string());
        record.updated_at = now;
        if let Err(e) = self.store.save_delivery(&record).await {
            error!(delivery_id = %record.id, error = %e, "durability gap: abandoned delivery not persisted");
        }
        self.release(record.id).await;
    }

    async fn release(&self, delivery_id: DeliveryId) {
        self.holds.lock().await.remove(&delivery_id);
    }
}
