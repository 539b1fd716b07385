//! Outbound webhook delivery engine.
//!
//! Fans domain events out to subscriber endpoints with signed HTTP requests,
//! per-subscriber filters, rate limits and circuit breakers, and durable
//! retries with exponential backoff.
//!
//! # Architecture
//!
//! Every (event, subscriber) pair passes through the same chain:
//!
//! 1. **Filter** - active subscriber filters must admit the event
//! 2. **Rate limit** - token bucket per subscriber
//! 3. **Circuit check** - breaker per subscriber
//! 4. **HTTP delivery** - one signed attempt, outcome recorded
//! 5. **Retry** - retryable failures are re-attempted by the retry scheduler
//!
//! Retry state lives in the [`DeliveryStore`](outpost_core::DeliveryStore);
//! a periodic scan picks up due retries after a restart. Breaker, limiter and
//! metrics state is in memory only.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use outpost_core::{Event, MemoryStore, RealClock};
//! use outpost_delivery::{DeliveryEngine, DeliveryError, EngineConfig};
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let store = MemoryStore::new();
//! let mut engine = DeliveryEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(store.clone()),
//!     Arc::new(store.clone()),
//!     Arc::new(store),
//!     Arc::new(RealClock::new()),
//! )?;
//! engine.start()?;
//!
//! let report = engine.dispatch(Event::new("document.created").with_field("id", 42)).await?;
//! println!("delivered to {} subscribers", report.delivered);
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod rate_limit;
pub mod recorder;
pub mod retry;
pub mod scheduler;
pub mod signing;
pub mod worker_pool;

pub use circuit::{CircuitBreakerManager, CircuitConfig, CircuitSnapshot, CircuitState};
pub use client::{AttemptOutcome, ClientConfig, DeliveryClient, DeliveryRequest};
pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher, DispatcherConfig};
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use filter::{FilterService, FilterTestResult, FilterUpdate, Operator};
pub use metrics::{MetricsAggregator, SubscriberMetrics};
pub use rate_limit::{RateLimit, RateLimiterRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{RetryScheduler, SchedulerConfig};

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default time to wait for in-flight work at shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
