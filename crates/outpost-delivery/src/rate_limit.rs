//! Per-subscriber token-bucket admission control.
//!
//! Limits are configured in requests per minute. A configured bucket refills
//! at `rpm / 60` tokens per second and holds at most `max(1, rpm / 10)`
//! tokens; it starts full. Subscribers without a limit are never throttled.

use std::{collections::HashMap, sync::Arc, time::Instant};

use outpost_core::{Clock, SubscriberId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Returned by [`RateLimiterRegistry::remaining`] for unlimited subscribers.
pub const UNLIMITED: i64 = -1;

/// A token bucket driven by an external clock.
#[derive(Debug, Clone)]
struct TokenBucket {
    requests_per_minute: u32,
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from((requests_per_minute / 10).max(1));
        Self {
            requests_per_minute,
            rate_per_sec: f64::from(requests_per_minute) / 60.0,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Configured limit of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimit {
    /// Configured requests per minute.
    pub requests_per_minute: u32,
    /// Refill rate in tokens per second.
    pub rate_per_sec: f64,
    /// Bucket capacity.
    pub burst: u32,
}

/// Registry of token buckets keyed by subscriber.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<SubscriberId, TokenBucket>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiterRegistry {
    /// Creates a registry with no limits.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), clock }
    }

    /// Sets a limit in requests per minute. Zero or less clears it.
    ///
    /// Replacing a limit starts a fresh, full bucket.
    pub async fn set_limit(&self, subscriber: SubscriberId, requests_per_minute: i64) {
        let mut buckets = self.buckets.lock().await;
        if requests_per_minute <= 0 {
            buckets.remove(&subscriber);
            drop(buckets);
            info!(subscriber_id = %subscriber, "rate limit cleared");
            return;
        }
        let rpm = u32::try_from(requests_per_minute).unwrap_or(u32::MAX);
        buckets.insert(subscriber, TokenBucket::new(rpm, self.clock.now()));
        drop(buckets);
        info!(subscriber_id = %subscriber, requests_per_minute = rpm, "rate limit set");
    }

    /// Consumes a token if one is available. Unlimited subscribers always pass.
    pub async fn allow(&self, subscriber: SubscriberId) -> bool {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().await;
        let Some(bucket) = buckets.get_mut(&subscriber) else {
            return true;
        };
        let allowed = bucket.try_acquire(now);
        if !allowed {
            debug!(subscriber_id = %subscriber, "rate limit exhausted");
        }
        allowed
    }

    /// Whole tokens currently available, or [`UNLIMITED`].
    #[allow(clippy::cast_possible_truncation)]
    pub async fn remaining(&self, subscriber: SubscriberId) -> i64 {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().await;
        match buckets.get_mut(&subscriber) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.tokens.floor() as i64
            },
            None => UNLIMITED,
        }
    }

    /// Configured limit, if any.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn limit(&self, subscriber: SubscriberId) -> Option<RateLimit> {
        self.buckets.lock().await.get(&subscriber).map(|b| RateLimit {
            requests_per_minute: b.requests_per_minute,
            rate_per_sec: b.rate_per_sec,
            burst: b.capacity as u32,
        })
    }

    /// Removes a subscriber's limit, returning whether one existed.
    pub async fn remove(&self, subscriber: SubscriberId) -> bool {
        self.buckets.lock().await.remove(&subscriber).is_some()
    }
}
