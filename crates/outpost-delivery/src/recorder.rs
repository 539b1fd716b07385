//! Runs one attempt and records everything that follows from it.
//!
//! Shared by the dispatcher (first attempts) and the retry scheduler (later
//! attempts) so both paths update the breaker, metrics, delivery record,
//! and attempt log the same way.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use outpost_core::{Clock, DeliveryAttempt, DeliveryRecord, DeliveryStore};
use tracing::{debug, error, info, warn};

use crate::{
    circuit::CircuitBreakerManager,
    client::{AttemptOutcome, DeliveryClient, DeliveryRequest},
    metrics::MetricsAggregator,
    error::DeliveryError,
    retry::{RetryDecision, RetryPolicy},
};

/// What happened to one attempt after it was recorded.
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    /// Executor outcome.
    pub outcome: AttemptOutcome,
    /// When the next attempt is due, if another is warranted.
    pub next_retry: Option<DateTime<Utc>>,
    /// Whether the delivery record reached the durable store.
    pub persisted: bool,
}

impl RecordedAttempt {
    /// Whether a follow-up attempt should be scheduled.
    ///
    /// Never true when the record was not persisted; a retry whose state the
    /// store does not know about cannot be serialized or recovered.
    pub fn wants_retry(&self) -> bool {
        self.persisted && self.next_retry.is_some()
    }
}

/// Executes attempts and persists their consequences.
#[derive(Debug)]
pub struct OutcomeRecorder {
    client: Arc<DeliveryClient>,
    store: Arc<dyn DeliveryStore>,
    circuits: Arc<CircuitBreakerManager>,
    metrics: Arc<MetricsAggregator>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl OutcomeRecorder {
    /// Creates a recorder.
    pub fn new(
        client: Arc<DeliveryClient>,
        store: Arc<dyn DeliveryStore>,
        circuits: Arc<CircuitBreakerManager>,
        metrics: Arc<MetricsAggregator>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, store, circuits, metrics, policy, clock }
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Makes the next attempt for `record` and records the result.
    ///
    /// Increments `record.attempts`, sends the request, updates the circuit
    /// breaker and metrics, stores the updated record and an attempt row.
    /// Store failures are logged as durability gaps and never abort the
    /// attempt.
    pub async fn attempt(&self, record: &mut DeliveryRecord, secret: Option<&str>) -> RecordedAttempt {
        record.attempts += 1;
        let request = DeliveryRequest {
            delivery_id: record.id,
            event_type: record.event_type.clone(),
            url: record.url.clone(),
            body: Bytes::from(record.payload.clone()),
            content_type: record.content_type.clone(),
            secret: secret.map(str::to_string),
            attempt: record.attempts,
        };

        let outcome = self.client.deliver(&request).await;

        if outcome.success {
            self.circuits.record_success(record.subscriber_id).await;
        } else {
            self.circuits.record_failure(record.subscriber_id).await;
        }
        self.metrics.record_delivery(record.subscriber_id, &outcome).await;

        let now = self.clock.now_utc();
        let mut exhausted_error = None;
        let next_retry = if outcome.success {
            None
        } else {
            match self.policy.decide(record.attempts, outcome.status_code, now) {
                RetryDecision::Retry { next_attempt_at } => Some(next_attempt_at),
                RetryDecision::Exhausted { attempts } => {
                    let exhausted = DeliveryError::retries_exhausted(attempts);
                    warn!(
                        delivery_id = %record.id,
                        subscriber_id = %record.subscriber_id,
                        status_code = outcome.status_code,
                        error = %exhausted,
                        "delivery failed permanently"
                    );
                    self.metrics.record_exhausted(record.subscriber_id).await;
                    exhausted_error = Some(exhausted);
                    None
                },
                RetryDecision::GiveUp { reason } => {
                    info!(
                        delivery_id = %record.id,
                        subscriber_id = %record.subscriber_id,
                        attempts = record.attempts,
                        status_code = outcome.status_code,
                        reason = %reason,
                        "delivery failed permanently"
                    );
                    None
                },
            }
        };

        record.status_code = outcome.status_code;
        record.success = outcome.success;
        record.error = match (&exhausted_error, outcome.success) {
            (_, true) => None,
            (Some(exhausted), false) => Some(format!("{exhausted}: {}", outcome.detail)),
            (None, false) => Some(outcome.detail.clone()),
        };
        record.duration_ms = outcome.duration_ms();
        record.next_retry = next_retry;
        record.updated_at = now;

        let persisted = match self.store.save_delivery(record).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    delivery_id = %record.id,
                    subscriber_id = %record.subscriber_id,
                    attempt = record.attempts,
                    error = %e,
                    "durability gap: delivery record not persisted, no retry will be scheduled"
                );
                false
            },
        };

        if let Err(e) = self.store.record_attempt(&DeliveryAttempt::from_record(record, now)).await {
            error!(
                delivery_id = %record.id,
                attempt = record.attempts,
                error = %e,
                "durability gap: attempt row not persisted"
            );
        }

        if outcome.success {
            debug!(delivery_id = %record.id, attempt = record.attempts, "delivery succeeded");
        } else if let Some(at) = next_retry {
            warn!(
                delivery_id = %record.id,
                attempt = record.attempts,
                status_code = outcome.status_code,
                next_retry = %at,
                "delivery failed, retry scheduled"
            );
        }

        RecordedAttempt { outcome, next_retry, persisted }
    }
}
