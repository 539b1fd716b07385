//! Fan-out of events to subscribers through a bounded worker pool.
//!
//! `dispatch` resolves the candidate subscribers, serializes the envelope
//! once, and queues one work item per subscriber. Each worker runs the
//! admission chain (filters, rate limit, circuit) and the first attempt, then
//! hands retryable failures to the [`RetryScheduler`]. `dispatch` waits for
//! every item's outcome before returning its [`DispatchReport`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use outpost_core::{
    Clock, DeliveryId, DeliveryRecord, Event, EventId, RetryTask, Subscriber, SubscriberDirectory,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    circuit::CircuitBreakerManager,
    error::{DeliveryError, Result},
    filter::FilterService,
    metrics::MetricsAggregator,
    rate_limit::RateLimiterRegistry,
    recorder::OutcomeRecorder,
    scheduler::RetryScheduler,
    worker_pool::{WorkQueue, WorkerPool},
};

/// Dispatcher worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Concurrent delivery workers.
    pub worker_count: usize,
    /// Bounded queue size. `dispatch` waits for room when it is full.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { worker_count: 8, queue_capacity: 1000 }
    }
}

/// What happened to one (event, subscriber) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// First attempt succeeded.
    Delivered,
    /// First attempt failed terminally.
    Failed,
    /// First attempt failed and a retry is scheduled.
    RetryScheduled,
    /// No active filter matched.
    Filtered,
    /// Rate limit denied the attempt.
    RateLimited,
    /// Circuit breaker denied the attempt.
    CircuitOpen,
}

/// Per-outcome counts for one dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Event dispatched.
    pub event_id: EventId,
    /// Subscribers whose first attempt succeeded.
    pub delivered: usize,
    /// Subscribers whose first attempt failed terminally.
    pub failed: usize,
    /// Subscribers with a retry pending.
    pub retry_scheduled: usize,
    /// Subscribers whose filters rejected the event.
    pub filtered: usize,
    /// Subscribers over their rate limit.
    pub rate_limited: usize,
    /// Subscribers behind an open circuit.
    pub circuit_open: usize,
    /// Inactive or uninterested subscribers, and items abandoned at shutdown.
    pub skipped: usize,
    /// Delivery records created by this dispatch.
    pub deliveries: Vec<DeliveryId>,
}

impl DispatchReport {
    fn new(event_id: EventId) -> Self {
        Self { event_id, ..Self::default() }
    }

    fn tally(&mut self, outcome: DispatchOutcome, delivery_id: Option<DeliveryId>) {
        match outcome {
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::RetryScheduled => self.retry_scheduled += 1,
            DispatchOutcome::Filtered => self.filtered += 1,
            DispatchOutcome::RateLimited => self.rate_limited += 1,
            DispatchOutcome::CircuitOpen => self.circuit_open += 1,
        }
        self.deliveries.extend(delivery_id);
    }

    /// Subscribers an attempt was made for.
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed + self.retry_scheduled
    }
}

type Reply = oneshot::Sender<(DispatchOutcome, Option<DeliveryId>)>;

struct WorkItem {
    event: Arc<Event>,
    document: Arc<Map<String, Value>>,
    body: Bytes,
    subscriber: Subscriber,
    reply: Reply,
}

/// Routes events to subscribers.
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    directory: Arc<dyn SubscriberDirectory>,
    filters: FilterService,
    limiter: Arc<RateLimiterRegistry>,
    circuits: Arc<CircuitBreakerManager>,
    metrics: Arc<MetricsAggregator>,
    recorder: Arc<OutcomeRecorder>,
    scheduler: Arc<RetryScheduler>,
    clock: Arc<dyn Clock>,
    queue: WorkQueue<WorkItem>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("event_id", &self.event.id)
            .field("subscriber_id", &self.subscriber.id)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher. Nothing runs until [`start`](Self::start).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        directory: Arc<dyn SubscriberDirectory>,
        filters: FilterService,
        limiter: Arc<RateLimiterRegistry>,
        circuits: Arc<CircuitBreakerManager>,
        metrics: Arc<MetricsAggregator>,
        recorder: Arc<OutcomeRecorder>,
        scheduler: Arc<RetryScheduler>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let queue = WorkQueue::bounded(config.queue_capacity);
        Arc::new(Self {
            config,
            directory,
            filters,
            limiter,
            circuits,
            metrics,
            recorder,
            scheduler,
            clock,
            queue,
            started: AtomicBool::new(false),
            cancel,
        })
    }

    /// Spawns the delivery workers.
    pub fn start(self: &Arc<Self>) -> WorkerPool {
        let mut pool = WorkerPool::new("dispatch", self.cancel.clone());
        pool.spawn_workers(self.config.worker_count, |_| {
            let dispatcher = Arc::clone(self);
            async move {
                while let Some(item) = dispatcher.queue.pop(&dispatcher.cancel).await {
                    dispatcher.handle(item).await;
                }
            }
        });
        self.started.store(true, Ordering::Release);
        pool
    }

    /// Delivers `event` to every interested active subscriber.
    ///
    /// Delivery failures are reported in the [`DispatchReport`], never as an
    /// error.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::NotStarted`] before the workers are running
    /// - [`DeliveryError::ShutdownRequested`] once shutdown has begun
    /// - a database error if the subscriber directory is unavailable
    pub async fn dispatch(&self, event: Event) -> Result<DispatchReport> {
        if !self.started.load(Ordering::Acquire) {
            return Err(DeliveryError::NotStarted);
        }
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::ShutdownRequested);
        }

        let subscribers = self.directory.list_active_subscribers().await?;
        let body = event
            .envelope_bytes()
            .map_err(|e| DeliveryError::internal(format!("failed to serialize event envelope: {e}")))?;
        let document = Arc::new(event.to_document());
        let event = Arc::new(event);
        let mut report = DispatchReport::new(event.id);

        let mut pending = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            if !subscriber.active || !subscriber.is_interested_in(&event.event_type) {
                report.skipped += 1;
                continue;
            }

            let (reply, outcome) = oneshot::channel();
            let item = WorkItem {
                event: Arc::clone(&event),
                document: Arc::clone(&document),
                body: body.clone(),
                subscriber,
                reply,
            };
            if self.queue.push(item, &self.cancel).await.is_err() {
                warn!(event_id = %event.id, "shutdown during dispatch, remaining subscribers skipped");
                report.skipped += 1;
                continue;
            }
            pending.push(outcome);
        }

        for outcome in pending {
            let received = tokio::select! {
                biased;
                received = outcome => received.ok(),
                () = self.cancel.cancelled() => None,
            };
            match received {
                Some((outcome, delivery_id)) => report.tally(outcome, delivery_id),
                None => report.skipped += 1,
            }
        }

        info!(
            event_id = %report.event_id,
            event_type = %event.event_type,
            delivered = report.delivered,
            failed = report.failed,
            retry_scheduled = report.retry_scheduled,
            filtered = report.filtered,
            rate_limited = report.rate_limited,
            circuit_open = report.circuit_open,
            skipped = report.skipped,
            "event dispatched"
        );
        Ok(report)
    }

    async fn handle(&self, item: WorkItem) {
        let span = info_span!(
            "dispatch_item",
            event_id = %item.event.id,
            subscriber_id = %item.subscriber.id,
        );
        let result = self.deliver(&item).instrument(span).await;
        if item.reply.send(result).is_err() {
            debug!("dispatch caller went away before outcome was reported");
        }
    }

    async fn deliver(&self, item: &WorkItem) -> (DispatchOutcome, Option<DeliveryId>) {
        let subscriber = &item.subscriber;

        if !self.filters.admits(subscriber.id, &item.document).await {
            self.metrics.record_filtered(subscriber.id).await;
            debug!("event filtered");
            return (DispatchOutcome::Filtered, None);
        }
        if !self.limiter.allow(subscriber.id).await {
            self.metrics.record_rate_limited(subscriber.id).await;
            debug!("rate limited");
            return (DispatchOutcome::RateLimited, None);
        }
        if !self.circuits.allow(subscriber.id).await {
            self.metrics.record_circuit_open(subscriber.id).await;
            debug!("circuit open");
            return (DispatchOutcome::CircuitOpen, None);
        }

        let mut record = DeliveryRecord::pending(subscriber, &item.event, &item.body, self.clock.now_utc());
        let recorded = self.recorder.attempt(&mut record, subscriber.secret.as_deref()).await;

        let outcome = if recorded.outcome.success {
            DispatchOutcome::Delivered
        } else if let (true, Some(due_at)) = (recorded.wants_retry(), recorded.next_retry) {
            self.scheduler.schedule(RetryTask::for_record(&record, subscriber, due_at)).await;
            DispatchOutcome::RetryScheduled
        } else {
            DispatchOutcome::Failed
        };
        (outcome, Some(record.id))
    }
}
