//! Per-subscriber delivery metrics.
//!
//! In-memory and best effort: counters reset on restart. Operators read them
//! as snapshots or as a flat key/value export for scraping.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use outpost_core::SubscriberId;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{client::AttemptOutcome, error::ErrorCategory};

/// Counters for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriberMetrics {
    /// HTTP attempts made.
    pub deliveries: u64,
    /// Attempts answered with 2xx.
    pub successes: u64,
    /// Attempts that failed.
    pub errors: u64,
    /// Events skipped by filters.
    pub filtered: u64,
    /// Events denied by the rate limiter.
    pub rate_limited: u64,
    /// Events denied by the circuit breaker.
    pub circuit_open: u64,
    /// Deliveries that used their whole attempt budget.
    pub retries_exhausted: u64,
    /// Failed attempts per error category label.
    pub error_categories: BTreeMap<String, u64>,
    /// Fastest attempt.
    pub latency_min_ms: Option<u64>,
    /// Slowest attempt.
    pub latency_max_ms: Option<u64>,
    /// Sum of attempt durations.
    pub latency_total_ms: u64,
    /// Attempts per response status; zero is "no response".
    pub status_codes: BTreeMap<u16, u64>,
    /// Most recent attempt.
    pub last_delivery_at: Option<DateTime<Utc>>,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl SubscriberMetrics {
    /// Successful share of attempts.
    pub fn success_rate(&self) -> f64 {
        ratio(self.successes, self.deliveries)
    }

    /// Failed share of attempts.
    pub fn error_rate(&self) -> f64 {
        ratio(self.errors, self.deliveries)
    }

    /// Share of considered events that were actually attempted.
    pub fn delivery_rate(&self) -> f64 {
        ratio(self.deliveries, self.deliveries + self.filtered + self.rate_limited + self.circuit_open)
    }

    /// Mean attempt duration.
    #[allow(clippy::cast_precision_loss)]
    pub fn latency_avg_ms(&self) -> f64 {
        ratio(self.latency_total_ms, self.deliveries)
    }

    /// Flat export with stable key names.
    #[allow(clippy::cast_precision_loss)]
    pub fn export(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert("deliveries".to_string(), self.deliveries as f64);
        out.insert("successes".to_string(), self.successes as f64);
        out.insert("errors".to_string(), self.errors as f64);
        out.insert("filtered".to_string(), self.filtered as f64);
        out.insert("rate_limited".to_string(), self.rate_limited as f64);
        out.insert("circuit_breaker_open".to_string(), self.circuit_open as f64);
        out.insert("retries_exhausted".to_string(), self.retries_exhausted as f64);
        out.insert("success_rate".to_string(), self.success_rate());
        out.insert("error_rate".to_string(), self.error_rate());
        out.insert("delivery_rate".to_string(), self.delivery_rate());
        out.insert("latency_min_ms".to_string(), self.latency_min_ms.unwrap_or(0) as f64);
        out.insert("latency_avg_ms".to_string(), self.latency_avg_ms());
        out.insert("latency_max_ms".to_string(), self.latency_max_ms.unwrap_or(0) as f64);
        for (code, count) in &self.status_codes {
            out.insert(format!("status_{code}"), *count as f64);
        }
        for (category, count) in &self.error_categories {
            out.insert(format!("errors_{category}"), *count as f64);
        }
        out
    }
}

/// Registry of metrics keyed by subscriber.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    subscribers: RwLock<HashMap<SubscriberId, SubscriberMetrics>>,
}

impl MetricsAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one HTTP attempt. Failures are also counted under the
    /// category of their error.
    pub async fn record_delivery(&self, subscriber: SubscriberId, outcome: &AttemptOutcome) {
        let millis = outcome.duration_ms();
        let status_code = outcome.status_code;
        let mut subscribers = self.subscribers.write().await;
        let m = subscribers.entry(subscriber).or_default();
        m.deliveries += 1;
        if outcome.success {
            m.successes += 1;
        } else {
            m.errors += 1;
            let category = outcome.error.as_ref().map_or(ErrorCategory::Internal, |e| e.category());
            *m.error_categories.entry(category.to_string()).or_default() += 1;
        }
        m.latency_total_ms = m.latency_total_ms.saturating_add(millis);
        m.latency_min_ms = Some(m.latency_min_ms.map_or(millis, |v| v.min(millis)));
        m.latency_max_ms = Some(m.latency_max_ms.map_or(millis, |v| v.max(millis)));
        *m.status_codes.entry(status_code).or_default() += 1;
        m.last_delivery_at = Some(Utc::now());
    }

    /// Records a delivery that used its whole attempt budget.
    pub async fn record_exhausted(&self, subscriber: SubscriberId) {
        self.subscribers.write().await.entry(subscriber).or_default().retries_exhausted += 1;
    }

    /// Records an event skipped by filters.
    pub async fn record_filtered(&self, subscriber: SubscriberId) {
        self.subscribers.write().await.entry(subscriber).or_default().filtered += 1;
    }

    /// Records an event denied by the rate limiter.
    pub async fn record_rate_limited(&self, subscriber: SubscriberId) {
        self.subscribers.write().await.entry(subscriber).or_default().rate_limited += 1;
    }

    /// Records an event denied by the circuit breaker.
    pub async fn record_circuit_open(&self, subscriber: SubscriberId) {
        self.subscribers.write().await.entry(subscriber).or_default().circuit_open += 1;
    }

    /// Copy of one subscriber's counters.
    pub async fn snapshot(&self, subscriber: SubscriberId) -> Option<SubscriberMetrics> {
        self.subscribers.read().await.get(&subscriber).cloned()
    }

    /// Flat export of one subscriber, empty if untracked.
    pub async fn export(&self, subscriber: SubscriberId) -> BTreeMap<String, f64> {
        self.snapshot(subscriber).await.map(|m| m.export()).unwrap_or_default()
    }

    /// Flat export of every subscriber.
    pub async fn export_all(&self) -> HashMap<SubscriberId, BTreeMap<String, f64>> {
        self.subscribers.read().await.iter().map(|(id, m)| (*id, m.export())).collect()
    }

    /// Zeroes one subscriber's counters.
    pub async fn reset(&self, subscriber: SubscriberId) {
        if let Some(m) = self.subscribers.write().await.get_mut(&subscriber) {
            *m = SubscriberMetrics::default();
        }
    }

    /// Forgets a subscriber.
    pub async fn remove(&self, subscriber: SubscriberId) -> bool {
        self.subscribers.write().await.remove(&subscriber).is_some()
    }
}
