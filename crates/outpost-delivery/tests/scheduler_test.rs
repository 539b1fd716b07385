//! Retry scheduler tests.
//!
//! Most tests build a scheduler without starting its workers, so queued
//! tasks stay queued and in-flight bookkeeping can be observed directly.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use outpost_core::{
    Clock, DeliveryRecord, DeliveryStore, Event, MemoryStore, RealClock, RetryTask, Subscriber,
};
use outpost_delivery::{
    circuit::{CircuitBreakerManager, CircuitConfig},
    client::DeliveryClient,
    metrics::MetricsAggregator,
    recorder::OutcomeRecorder,
    retry::RetryPolicy,
    scheduler::{RetryScheduler, SchedulerConfig},
    DeliveryError,
};
use outpost_testing::EngineHarness;
use tokio_util::sync::CancellationToken;

fn scheduler(store: &MemoryStore, queue_capacity: usize) -> Arc<RetryScheduler> {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let circuits = Arc::new(CircuitBreakerManager::new(CircuitConfig::default(), clock.clone()));
    let metrics = Arc::new(MetricsAggregator::new());
    let recorder = Arc::new(OutcomeRecorder::new(
        Arc::new(DeliveryClient::with_defaults().unwrap()),
        Arc::new(store.clone()),
        circuits.clone(),
        metrics.clone(),
        RetryPolicy::default(),
        clock.clone(),
    ));
    let config = SchedulerConfig { queue_capacity, ..SchedulerConfig::default() };
    RetryScheduler::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        recorder,
        circuits,
        metrics,
        clock,
        CancellationToken::new(),
    )
}

async fn failed_delivery(store: &MemoryStore, subscriber: &Subscriber, overdue: bool) -> DeliveryRecord {
    let event = Event::new("X");
    let mut record = DeliveryRecord::pending(subscriber, &event, b"{}", Utc::now());
    record.attempts = 1;
    record.status_code = 503;
    record.next_retry = Some(if overdue {
        Utc::now() - chrono::Duration::seconds(1)
    } else {
        Utc::now() + chrono::Duration::hours(1)
    });
    store.save_delivery(&record).await.unwrap();
    record
}

#[tokio::test]
async fn scan_enqueues_due_deliveries_once() {
    let store = MemoryStore::new();
    let subscriber = Subscriber::new("http://127.0.0.1:9/hook");
    store.upsert_subscriber(subscriber.clone()).await;
    let due = failed_delivery(&store, &subscriber, true).await;
    failed_delivery(&store, &subscriber, false).await;
    let scheduler = scheduler(&store, 10);

    assert_eq!(scheduler.scan_due_retries().await.unwrap(), 1);
    assert!(scheduler.is_in_flight(due.id).await);
    assert_eq!(scheduler.scan_due_retries().await.unwrap(), 0);
}

#[tokio::test]
async fn scan_abandons_deliveries_of_deleted_subscribers() {
    let store = MemoryStore::new();
    let orphaned = Subscriber::new("http://127.0.0.1:9/hook");
    let record = failed_delivery(&store, &orphaned, true).await;
    let scheduler = scheduler(&store, 10);

    assert_eq!(scheduler.scan_due_retries().await.unwrap(), 0);

    let stored = store.get_delivery(record.id).await.unwrap().unwrap();
    assert!(stored.next_retry.is_none());
    assert!(!scheduler.is_in_flight(record.id).await);
}

#[tokio::test]
async fn manual_retry_is_refused_while_held() {
    let store = MemoryStore::new();
    let subscriber = Subscriber::new("http://127.0.0.1:9/hook");
    store.upsert_subscriber(subscriber.clone()).await;
    let record = failed_delivery(&store, &subscriber, false).await;
    let scheduler = scheduler(&store, 10);

    scheduler.retry_now(record.id).await.expect("first retry");
    let second = scheduler.retry_now(record.id).await;

    assert!(matches!(second, Err(DeliveryError::RetryInProgress { .. })));
}

#[tokio::test]
async fn manual_retry_takes_over_a_waiting_retry() {
    let store = MemoryStore::new();
    let subscriber = Subscriber::new("http://127.0.0.1:9/hook");
    store.upsert_subscriber(subscriber.clone()).await;
    let record = failed_delivery(&store, &subscriber, false).await;
    let scheduler = scheduler(&store, 10);
    let due_at = record.next_retry.expect("scheduled");

    scheduler.schedule(RetryTask::for_record(&record, &subscriber, due_at)).await;
    assert!(scheduler.is_in_flight(record.id).await);
    assert!(!scheduler.is_active(record.id).await);

    scheduler.retry_now(record.id).await.expect("manual retry while waiting");

    assert!(scheduler.is_active(record.id).await);
    let again = scheduler.retry_now(record.id).await;
    assert!(matches!(again, Err(DeliveryError::RetryInProgress { .. })));
}

#[tokio::test]
async fn manual_retry_reports_full_queue_and_releases_hold() {
    let store = MemoryStore::new();
    let subscriber = Subscriber::new("http://127.0.0.1:9/hook");
    store.upsert_subscriber(subscriber.clone()).await;
    let first = failed_delivery(&store, &subscriber, false).await;
    let second = failed_delivery(&store, &subscriber, false).await;
    let scheduler = scheduler(&store, 1);

    scheduler.retry_now(first.id).await.expect("first retry");
    let result = scheduler.retry_now(second.id).await;

    assert!(matches!(result, Err(DeliveryError::QueueFull)));
    assert!(result.unwrap_err().is_retryable());
    assert!(!scheduler.is_in_flight(second.id).await);
}

#[tokio::test]
async fn manual_retry_of_missing_subscriber_is_not_found() {
    let store = MemoryStore::new();
    let record = failed_delivery(&store, &Subscriber::new("http://127.0.0.1:9/hook"), false).await;
    let scheduler = scheduler(&store, 10);

    let result = scheduler.retry_now(record.id).await;

    assert!(matches!(result, Err(DeliveryError::NotFound { .. })));
}

#[tokio::test]
async fn open_circuit_defers_retry_without_spending_attempts() {
    let circuit = CircuitConfig {
        failure_threshold: 2,
        success_threshold: 3,
        recovery_timeout: Duration::from_millis(300),
    };
    let harness = EngineHarness::builder().circuit(circuit).max_attempts(5).start().await.expect("harness");
    harness.http.mock_sequence("/hook").respond_times(503, 2).then_always(200).build().await;
    let subscriber = harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    let record = harness.wait_for_terminal(report.deliveries[0]).await.expect("record");

    assert!(record.success);
    assert_eq!(record.attempts, 3);
    assert_eq!(harness.http.request_count().await, 3);
    let metrics = harness.engine.export_metrics(subscriber.id).await;
    assert!(metrics["circuit_breaker_open"] >= 1.0);

    harness.shutdown().await.expect("shutdown");
}
