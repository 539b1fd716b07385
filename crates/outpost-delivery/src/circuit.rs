//! Per-subscriber circuit breakers.
//!
//! A breaker stops attempts to a subscriber that keeps failing and probes for
//! recovery once its cool-down has passed.
//!
//! ```text
//!   CLOSED ── failure_threshold consecutive failures ──▶ OPEN
//!     ▲                                                   │
//!     │                                        allow() at/after
//!     │                                      next_retry_eligible
//!     │                                                   ▼
//!     └──── success_threshold consecutive successes ── HALF_OPEN
//!                                                         │
//!                          any failure reopens ◀──────────┘
//! ```
//!
//! State lives in one registry behind a single lock. Callers only see
//! method-level operations, so the state machine cannot be bypassed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use outpost_core::{Clock, SubscriberId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long an open circuit blocks before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 3, recovery_timeout: Duration::from_secs(30) }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are denied until the recovery timeout passes.
    Open,
    /// Probe requests are let through; their outcome decides the next state.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one subscriber's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success or reset.
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open.
    pub consecutive_successes: u32,
    /// Last recorded failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last recorded success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// When an open circuit admits its next probe.
    pub next_retry_eligible_at: Option<DateTime<Utc>>,
    /// Last state transition.
    pub last_state_change: DateTime<Utc>,
    /// Lifetime outcomes recorded.
    pub total_requests: u64,
    /// Lifetime successes.
    pub succeeded_requests: u64,
    /// Lifetime failures.
    pub failed_requests: u64,
}

impl CircuitSnapshot {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            next_retry_eligible_at: None,
            last_state_change: now,
            total_requests: 0,
            succeeded_requests: 0,
            failed_requests: 0,
        }
    }

    /// Lifetime failure ratio, zero before any outcome.
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Registry of breakers keyed by subscriber.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: RwLock<CircuitConfig>,
    circuits: Mutex<HashMap<SubscriberId, CircuitSnapshot>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerManager {
    /// Creates an empty registry.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config: RwLock::new(config), circuits: Mutex::new(HashMap::new()), clock }
    }

    /// Current configuration.
    pub async fn config(&self) -> CircuitConfig {
        self.config.read().await.clone()
    }

    /// Replaces the configuration. Existing breakers keep their state.
    pub async fn set_config(&self, config: CircuitConfig) {
        info!(
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs(),
            "circuit breaker configuration replaced"
        );
        *self.config.write().await = config;
    }

    /// Whether an attempt to `subscriber` may proceed.
    ///
    /// An open circuit whose recovery time has arrived moves to half-open and
    /// admits the caller as the probe.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn allow(&self, subscriber: SubscriberId) -> bool {
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(subscriber).or_insert_with(|| CircuitSnapshot::new(now));

        match stats.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if stats.next_retry_eligible_at.is_some_and(|at| now >= at) {
                    Self::transition_to_half_open(stats, now);
                    debug!(subscriber_id = %subscriber, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Like [`allow`](Self::allow) but as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::CircuitOpen`] when the attempt is denied.
    pub async fn check(&self, subscriber: SubscriberId) -> Result<()> {
        if self.allow(subscriber).await {
            Ok(())
        } else {
            Err(DeliveryError::circuit_open(subscriber))
        }
    }

    /// Records a successful attempt.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn record_success(&self, subscriber: SubscriberId) {
        let success_threshold = self.config.read().await.success_threshold;
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(subscriber).or_insert_with(|| CircuitSnapshot::new(now));

        stats.total_requests += 1;
        stats.succeeded_requests += 1;
        stats.last_success_at = Some(now);

        match stats.state {
            CircuitState::Closed => stats.consecutive_failures = 0,
            CircuitState::Open => {
                warn!(subscriber_id = %subscriber, "success recorded while circuit open");
            },
            CircuitState::HalfOpen => {
                stats.consecutive_successes += 1;
                if stats.consecutive_successes >= success_threshold {
                    Self::transition_to_closed(stats, now);
                    info!(subscriber_id = %subscriber, "circuit closed after recovery");
                }
            },
        }
    }

    /// Records a failed attempt.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn record_failure(&self, subscriber: SubscriberId) {
        let config = self.config.read().await.clone();
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(subscriber).or_insert_with(|| CircuitSnapshot::new(now));

        stats.total_requests += 1;
        stats.failed_requests += 1;
        stats.last_failure_at = Some(now);

        match stats.state {
            CircuitState::Closed => {
                stats.consecutive_failures += 1;
                if stats.consecutive_failures >= config.failure_threshold {
                    Self::transition_to_open(stats, now, config.recovery_timeout);
                    warn!(
                        subscriber_id = %subscriber,
                        consecutive_failures = stats.consecutive_failures,
                        "circuit opened"
                    );
                }
            },
            CircuitState::Open => stats.consecutive_failures += 1,
            CircuitState::HalfOpen => {
                stats.consecutive_failures += 1;
                Self::transition_to_open(stats, now, config.recovery_timeout);
                warn!(subscriber_id = %subscriber, "probe failed, circuit reopened");
            },
        }
    }

    /// Forces a circuit closed with zeroed counters.
    pub async fn reset(&self, subscriber: SubscriberId) {
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(subscriber).or_insert_with(|| CircuitSnapshot::new(now));
        Self::transition_to_closed(stats, now);
        drop(circuits);
        info!(subscriber_id = %subscriber, "circuit reset by operator");
    }

    /// Drops a subscriber's breaker entirely.
    pub async fn remove(&self, subscriber: SubscriberId) -> bool {
        self.circuits.lock().await.remove(&subscriber).is_some()
    }

    /// Forces a specific state.
    pub async fn force_state(&self, subscriber: SubscriberId, state: CircuitState) {
        let recovery_timeout = self.config.read().await.recovery_timeout;
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(subscriber).or_insert_with(|| CircuitSnapshot::new(now));
        match state {
            CircuitState::Closed => Self::transition_to_closed(stats, now),
            CircuitState::Open => Self::transition_to_open(stats, now, recovery_timeout),
            CircuitState::HalfOpen => Self::transition_to_half_open(stats, now),
        }
    }

    /// Snapshot of one breaker, `None` if never referenced.
    pub async fn snapshot(&self, subscriber: SubscriberId) -> Option<CircuitSnapshot> {
        self.circuits.lock().await.get(&subscriber).cloned()
    }

    /// Current state, `Closed` for untracked subscribers.
    pub async fn state(&self, subscriber: SubscriberId) -> CircuitState {
        self.snapshot(subscriber).await.map_or(CircuitState::Closed, |s| s.state)
    }

    /// Snapshots of every tracked breaker.
    pub async fn all_circuits(&self) -> HashMap<SubscriberId, CircuitSnapshot> {
        self.circuits.lock().await.clone()
    }

    /// When an open circuit will next admit a probe.
    pub async fn next_eligible_at(&self, subscriber: SubscriberId) -> Option<DateTime<Utc>> {
        let circuits = self.circuits.lock().await;
        circuits
            .get(&subscriber)
            .filter(|s| s.state == CircuitState::Open)
            .and_then(|s| s.next_retry_eligible_at)
    }

    fn transition_to_open(stats: &mut CircuitSnapshot, now: DateTime<Utc>, timeout: Duration) {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
        stats.state = CircuitState::Open;
        stats.consecutive_successes = 0;
        stats.next_retry_eligible_at = Some(now.checked_add_signed(timeout).unwrap_or(now));
        stats.last_state_change = now;
    }

    fn transition_to_half_open(stats: &mut CircuitSnapshot, now: DateTime<Utc>) {
        stats.state = CircuitState::HalfOpen;
        stats.consecutive_successes = 0;
        stats.last_state_change = now;
    }

    fn transition_to_closed(stats: &mut CircuitSnapshot, now: DateTime<Utc>) {
        stats.state = CircuitState::Closed;
        stats.consecutive_failures = 0;
        stats.consecutive_successes = 0;
        stats.next_retry_eligible_at = None;
        stats.last_state_change = now;
    }
}

#[cfg(test)]
mod tests {
    use outpost_core::TestClock;

    use super::*;

    fn manager() -> (CircuitBreakerManager, TestClock) {
        let clock = TestClock::new();
        (CircuitBreakerManager::new(CircuitConfig::default(), Arc::new(clock.clone())), clock)
    }

    async fn fail_times(manager: &CircuitBreakerManager, id: SubscriberId, n: u32) {
        for _ in 0..n {
            manager.record_failure(id).await;
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let (manager, _) = manager();
        let id = SubscriberId::new();

        fail_times(&manager, id, 4).await;
        assert!(manager.allow(id).await);

        manager.record_failure(id).await;
        assert_eq!(manager.state(id).await, CircuitState::Open);
        assert!(!manager.allow(id).await);
        assert!(manager.check(id).await.is_err());
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let (manager, _) = manager();
        let id = SubscriberId::new();

        fail_times(&manager, id, 4).await;
        manager.record_success(id).await;
        fail_times(&manager, id, 4).await;

        assert_eq!(manager.state(id).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout() {
        let (manager, clock) = manager();
        let id = SubscriberId::new();
        fail_times(&manager, id, 5).await;

        clock.advance(Duration::from_secs(29));
        assert!(!manager.allow(id).await);

        clock.advance(Duration::from_secs(1));
        assert!(manager.allow(id).await);
        assert_eq!(manager.state(id).await, CircuitState::HalfOpen);
        assert!(manager.allow(id).await);
    }

    #[tokio::test]
    async fn closes_after_success_threshold() {
        let (manager, clock) = manager();
        let id = SubscriberId::new();
        fail_times(&manager, id, 5).await;
        clock.advance(Duration::from_secs(30));
        assert!(manager.allow(id).await);

        manager.record_success(id).await;
        manager.record_success(id).await;
        assert_eq!(manager.state(id).await, CircuitState::HalfOpen);

        manager.record_success(id).await;
        let snapshot = manager.snapshot(id).await.expect("tracked");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes, 0);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens_with_fresh_timeout() {
        let (manager, clock) = manager();
        let id = SubscriberId::new();
        fail_times(&manager, id, 5).await;
        clock.advance(Duration::from_secs(30));
        assert!(manager.allow(id).await);
        manager.record_success(id).await;

        manager.record_failure(id).await;

        let snapshot = manager.snapshot(id).await.expect("tracked");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert_eq!(
            snapshot.next_retry_eligible_at,
            Some(clock.now_utc() + chrono::Duration::seconds(30))
        );
        assert!(!manager.allow(id).await);
    }

    #[tokio::test]
    async fn reset_and_remove() {
        let (manager, _) = manager();
        let id = SubscriberId::new();
        fail_times(&manager, id, 5).await;

        manager.reset(id).await;
        assert!(manager.allow(id).await);
        assert_eq!(manager.next_eligible_at(id).await, None);

        assert!(manager.remove(id).await);
        assert!(manager.snapshot(id).await.is_none());
        assert!(!manager.remove(id).await);
    }

    #[tokio::test]
    async fn config_is_replaceable_at_runtime() {
        let (manager, _) = manager();
        let id = SubscriberId::new();
        manager
            .set_config(CircuitConfig { failure_threshold: 2, ..CircuitConfig::default() })
            .await;

        fail_times(&manager, id, 2).await;

        assert_eq!(manager.state(id).await, CircuitState::Open);
        assert!(manager.next_eligible_at(id).await.is_some());
    }

    #[tokio::test]
    async fn snapshots_track_lifetime_counters() {
        let (manager, _) = manager();
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        manager.record_success(a).await;
        manager.record_failure(a).await;
        manager.record_failure(b).await;

        let all = manager.all_circuits().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[&a].total_requests, 2);
        assert!((all[&a].failure_rate() - 0.5).abs() < f64::EPSILON);

        let json = serde_json::to_value(&all[&b]).expect("serializes");
        assert_eq!(json["state"], "closed");
    }
}
