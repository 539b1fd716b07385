//! End-to-end tests for the delivery engine.
//!
//! Each test runs a real engine over an in-memory store against a wiremock
//! subscriber endpoint.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use chrono::Utc;
use outpost_core::{DeliveryId, DeliveryRecord, DeliveryStore, Event, FilterGroup, FilterRule};
use outpost_delivery::{
    circuit::{CircuitConfig, CircuitState},
    client::{DELIVERY_HEADER, EVENT_HEADER},
    signing::{verify_signature, SIGNATURE_HEADER},
    DeliveryError, FilterUpdate,
};
use outpost_testing::{rule_group, EngineHarness, EventBuilder, SubscriberBuilder};
use serde_json::json;

#[tokio::test]
async fn successful_delivery_records_one_attempt() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");

    assert_eq!(report.delivered, 1);
    assert_eq!(report.attempted(), 1);
    let attempts = harness.store.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert_eq!(attempts[0].status_code, 200);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(harness.engine.circuit_state(subscriber.id).await, CircuitState::Closed);

    let record = harness.engine.delivery(report.deliveries[0]).await.unwrap().expect("record");
    assert!(record.success);
    assert!(record.next_retry.is_none());

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn filtered_event_is_never_attempted() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness.add_subscriber("/hook").await;
    harness
        .engine
        .create_filter(subscriber.id, "public only", 0, rule_group("visibility", "eq", "public"))
        .await
        .expect("filter");

    let event = EventBuilder::new("document.updated").field("visibility", "private").build();
    let report = harness.engine.dispatch(event).await.expect("dispatch");

    assert_eq!(report.filtered, 1);
    assert_eq!(report.attempted(), 0);
    assert!(harness.store.attempts().await.is_empty());
    assert_eq!(harness.http.request_count().await, 0);
    let metrics = harness.engine.export_metrics(subscriber.id).await;
    assert_eq!(metrics["filtered"], 1.0);
    assert_eq!(metrics["deliveries"], 0.0);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn persistent_server_errors_exhaust_budget_and_open_circuit() {
    let harness = EngineHarness::builder().max_attempts(5).start().await.expect("harness");
    harness.http.mock_status("/hook", 503).await;
    let subscriber = harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(report.retry_scheduled, 1);
    let delivery_id = report.deliveries[0];

    let record = harness.wait_for_terminal(delivery_id).await.expect("record");
    let attempts = harness.wait_for_attempts(delivery_id, 5).await;

    assert!(!record.success);
    assert_eq!(record.attempts, 5);
    assert!(record.next_retry.is_none());
    assert_eq!(record.status_code, 503);
    assert_eq!(attempts.len(), 5);
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert!(attempts[..4].iter().all(|a| a.next_retry.is_some()));
    assert!(attempts[4].next_retry.is_none());
    assert_eq!(harness.engine.circuit_state(subscriber.id).await, CircuitState::Open);
    assert!(record.error.as_deref().is_some_and(|e| e.starts_with("delivery failed after 5 attempts")));
    let metrics = harness.engine.export_metrics(subscriber.id).await;
    assert_eq!(metrics["retries_exhausted"], 1.0);
    assert_eq!(metrics["errors_server"], 5.0);

    // Nothing further is attempted once terminal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.http.request_count().await, 5);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 404).await;
    harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");

    assert_eq!(report.failed, 1);
    let record = harness.engine.delivery(report.deliveries[0]).await.unwrap().expect("record");
    assert_eq!(record.attempts, 1);
    assert_eq!(record.status_code, 404);
    assert!(record.next_retry.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.http.request_count().await, 1);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn transient_failure_then_success() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_sequence("/hook").respond_with(503).respond_with(429).then_always(200).build().await;
    harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    let record = harness.wait_for_terminal(report.deliveries[0]).await.expect("record");

    assert!(record.success);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.status_code, 200);
    let history = harness.engine.delivery_history(report.deliveries[0]).await.expect("history");
    let statuses: Vec<u16> = history.iter().map(|a| a.status_code).collect();
    assert_eq!(statuses, vec![503, 429, 200]);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn requests_are_signed_and_correlated() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness
        .register(SubscriberBuilder::new(harness.http.endpoint("/hook")).secret("whsec_test").build())
        .await;
    let event = EventBuilder::with_defaults().build();
    let event_id = event.id;

    let report = harness.engine.dispatch(event).await.expect("dispatch");
    assert_eq!(report.delivered, 1);

    let requests = harness.http.received_requests().await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let signature = request.header(SIGNATURE_HEADER).expect("signature header");
    assert!(signature.starts_with("sha256="));
    assert!(verify_signature(&request.body, signature, "whsec_test"));
    assert!(!verify_signature(&request.body, signature, "other"));
    assert_eq!(request.header(EVENT_HEADER), Some("document.updated"));
    assert_eq!(request.header(DELIVERY_HEADER), Some(report.deliveries[0].to_string().as_str()));

    let body = request.json();
    assert_eq!(body["id"], json!(event_id.to_string()));
    assert_eq!(body["type"], "document.updated");
    assert_eq!(body["data"]["visibility"], "public");
    assert_eq!(body["actor"]["type"], "user");
    assert_eq!(subscriber.secret.as_deref(), Some("whsec_test"));

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unsigned_subscribers_get_no_signature() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    harness.add_subscriber("/hook").await;

    harness.engine.dispatch(Event::new("X")).await.expect("dispatch");

    let requests = harness.http.received_requests().await;
    outpost_testing::http::assertions::assert_header_absent(&requests[0], SIGNATURE_HEADER);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn uninterested_and_inactive_subscribers_are_skipped() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    harness
        .register(SubscriberBuilder::new(harness.http.endpoint("/hook")).event_type("user.created").build())
        .await;
    harness.register(SubscriberBuilder::new(harness.http.endpoint("/hook")).inactive().build()).await;

    let report = harness.engine.dispatch(Event::new("document.deleted")).await.expect("dispatch");

    assert_eq!(report.skipped, 1);
    assert_eq!(report.attempted(), 0);
    assert_eq!(report.filtered, 0);
    assert_eq!(harness.http.request_count().await, 0);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn any_matching_filter_admits_the_event() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness.add_subscriber("/hook").await;
    harness
        .engine
        .create_filter(subscriber.id, "public", 0, rule_group("visibility", "eq", "public"))
        .await
        .unwrap();
    harness
        .engine
        .create_filter(subscriber.id, "admins", 1, rule_group("actor.type", "eq", "admin"))
        .await
        .unwrap();

    let event = EventBuilder::new("document.updated").field("visibility", "public").actor("user", "Ada").build();
    let report = harness.engine.dispatch(event).await.expect("dispatch");

    assert_eq!(report.delivered, 1);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rate_limited_subscriber_is_not_attempted() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness.add_subscriber("/hook").await;
    harness.engine.set_rate_limit(subscriber.id, 10).await;

    let first = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    let second = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");

    assert_eq!(first.delivered, 1);
    assert_eq!(second.rate_limited, 1);
    assert_eq!(harness.http.request_count().await, 1);
    assert_eq!(harness.engine.export_metrics(subscriber.id).await["rate_limited"], 1.0);

    assert!(harness.engine.remove_rate_limit(subscriber.id).await);
    assert_eq!(harness.engine.remaining_requests(subscriber.id).await, -1);
    let third = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(third.delivered, 1);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn open_circuit_blocks_dispatch_until_reset() {
    let circuit = CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() };
    let harness = EngineHarness::builder().max_attempts(1).circuit(circuit).start().await.expect("harness");
    harness.http.mock_sequence("/hook").respond_with(500).then_always(200).build().await;
    let subscriber = harness.add_subscriber("/hook").await;

    let first = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(first.failed, 1);
    assert_eq!(harness.engine.circuit_state(subscriber.id).await, CircuitState::Open);

    let blocked = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(blocked.circuit_open, 1);
    assert_eq!(harness.http.request_count().await, 1);
    assert_eq!(harness.engine.export_metrics(subscriber.id).await["circuit_breaker_open"], 1.0);

    harness.engine.reset_circuit(subscriber.id).await;
    let after_reset = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(after_reset.delivered, 1);
    assert_eq!(harness.engine.circuit_state(subscriber.id).await, CircuitState::Closed);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn manual_retry_redelivers_terminal_failure() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_sequence("/hook").respond_with(400).then_always(200).build().await;
    harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(report.failed, 1);
    let delivery_id = report.deliveries[0];

    harness.engine.retry_delivery(delivery_id).await.expect("manual retry");
    let attempts = harness.wait_for_attempts(delivery_id, 2).await;
    let record = harness.wait_for_terminal(delivery_id).await.expect("record");

    assert_eq!(attempts.len(), 2);
    assert!(record.success);
    assert_eq!(record.attempts, 2);

    let again = harness.engine.retry_delivery(delivery_id).await;
    assert!(matches!(again, Err(DeliveryError::AlreadyDelivered { .. })));

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn manual_retry_supersedes_pending_backoff() {
    let harness = EngineHarness::builder()
        .initial_delay(Duration::from_secs(60))
        .configure(|config| config.retry.max_delay = Duration::from_secs(120))
        .start()
        .await
        .expect("harness");
    harness.http.mock_sequence("/hook").respond_with(503).then_always(200).build().await;
    harness.add_subscriber("/hook").await;

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert_eq!(report.retry_scheduled, 1);
    let delivery_id = report.deliveries[0];

    harness.engine.retry_delivery(delivery_id).await.expect("manual retry during backoff");
    let record = harness.wait_for_terminal(delivery_id).await.expect("record");

    assert!(record.success);
    assert_eq!(record.attempts, 2);
    assert!(record.next_retry.is_none());
    assert_eq!(harness.http.request_count().await, 2);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn manual_retry_of_unknown_delivery_is_not_found() {
    let harness = EngineHarness::builder().start().await.expect("harness");

    let result = harness.engine.retry_delivery(DeliveryId::new()).await;

    assert!(matches!(result, Err(DeliveryError::NotFound { .. })));
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn due_retries_in_store_are_resumed_after_restart() {
    let harness = EngineHarness::builder().build().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness.add_subscriber("/hook").await;

    // Left behind by a previous process: one failed attempt, retry overdue.
    let event = Event::new("X");
    let body = event.envelope_bytes().unwrap();
    let mut record = DeliveryRecord::pending(&subscriber, &event, &body, Utc::now());
    record.attempts = 1;
    record.status_code = 503;
    record.next_retry = Some(Utc::now() - chrono::Duration::seconds(5));
    harness.store.save_delivery(&record).await.unwrap();

    let EngineHarness { store, http, mut engine } = harness;
    engine.start().expect("start");
    let harness = EngineHarness { store, http, engine };

    let resumed = harness.wait_for_terminal(record.id).await.expect("record");
    assert!(resumed.success);
    assert_eq!(resumed.attempts, 2);
    assert_eq!(harness.http.request_count().await, 1);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn store_outage_during_dispatch_does_not_schedule_retry() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 503).await;
    harness.add_subscriber("/hook").await;
    harness.store.fail_writes(true);

    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");

    assert_eq!(report.failed, 1);
    assert_eq!(report.retry_scheduled, 0);
    assert_eq!(harness.http.request_count().await, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.http.request_count().await, 1);

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn directory_outage_fails_dispatch() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.store.fail_directory(true);

    let result = harness.engine.dispatch(Event::new("X")).await;

    assert!(matches!(result, Err(DeliveryError::Database { .. })));
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn dispatch_requires_running_engine() {
    let harness = EngineHarness::builder().build().await.expect("harness");

    let result = harness.engine.dispatch(Event::new("X")).await;
    assert!(matches!(result, Err(DeliveryError::NotStarted)));
    let retry = harness.engine.retry_delivery(DeliveryId::new()).await;
    assert!(matches!(retry, Err(DeliveryError::NotStarted)));

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn dispatch_after_cancellation_is_refused() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.engine.cancellation_token().cancel();

    let result = harness.engine.dispatch(Event::new("X")).await;

    assert!(matches!(result, Err(DeliveryError::ShutdownRequested)));
    assert!(!harness.engine.is_running());
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn filter_operations_validate_and_persist() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    let subscriber = harness.add_subscriber("/hook").await;

    let invalid = harness
        .engine
        .create_filter(subscriber.id, "bad", 0, rule_group("name", "regex", "([unclosed"))
        .await;
    assert!(matches!(invalid, Err(DeliveryError::InvalidFilter { .. })));

    let created = harness
        .engine
        .create_filter(subscriber.id, "revisions", 1, rule_group("revision", "gte", 2))
        .await
        .expect("create");
    let updated = harness
        .engine
        .update_filter(created.id, FilterUpdate { active: Some(false), ..FilterUpdate::default() })
        .await
        .expect("update");
    assert!(!updated.active);

    let listed = harness.engine.list_filters(subscriber.id).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    harness.engine.delete_filter(created.id).await.expect("delete");
    assert!(harness.engine.list_filters(subscriber.id).await.unwrap().is_empty());
    assert!(matches!(harness.engine.delete_filter(created.id).await, Err(DeliveryError::NotFound { .. })));

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_filter_has_no_side_effects() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    let group = FilterGroup::any(vec![
        FilterRule::new("visibility", "eq", "private"),
        FilterRule::new("revision", "gt", 1),
    ]);
    let event = EventBuilder::with_defaults().build();

    let result = harness.engine.test_filter(&group, &event).expect("valid group");

    assert!(result.matched);
    assert_eq!(result.rules.len(), 2);
    assert!(!result.rules[0].matched);
    assert!(result.rules[1].matched);
    assert!(harness.engine.all_circuits().await.is_empty());
    assert!(harness.engine.export_all_metrics().await.is_empty());

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn forget_subscriber_clears_in_memory_state() {
    let harness = EngineHarness::builder().start().await.expect("harness");
    harness.http.mock_status("/hook", 200).await;
    let subscriber = harness.add_subscriber("/hook").await;
    harness.engine.set_rate_limit(subscriber.id, 600).await;
    harness.engine.dispatch(Event::new("X")).await.expect("dispatch");
    assert!(harness.engine.metrics(subscriber.id).await.is_some());
    assert!(harness.engine.circuit_snapshot(subscriber.id).await.is_some());

    harness.engine.forget_subscriber(subscriber.id).await;

    assert!(harness.engine.metrics(subscriber.id).await.is_none());
    assert!(harness.engine.circuit_snapshot(subscriber.id).await.is_none());
    assert!(harness.engine.rate_limit(subscriber.id).await.is_none());

    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn circuit_config_and_metrics_can_be_changed_at_runtime() {
    let harness = EngineHarness::builder().max_attempts(1).start().await.expect("harness");
    harness.http.mock_status("/hook", 500).await;
    let subscriber = harness.add_subscriber("/hook").await;

    harness
        .engine
        .set_circuit_config(CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() })
        .await;
    let report = harness.engine.dispatch(Event::new("X")).await.expect("dispatch");

    assert_eq!(report.failed, 1);
    assert_eq!(harness.engine.circuit_state(subscriber.id).await, CircuitState::Open);
    assert_eq!(harness.engine.metrics(subscriber.id).await.expect("tracked").errors, 1);

    harness.engine.reset_metrics(subscriber.id).await;

    let metrics = harness.engine.metrics(subscriber.id).await.expect("still tracked");
    assert_eq!(metrics.deliveries, 0);
    assert_eq!(metrics.errors, 0);

    harness.shutdown().await.expect("shutdown");
}
