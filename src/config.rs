//! Service configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use outpost_delivery::{
    CircuitConfig, ClientConfig, DispatcherConfig, EngineConfig, RetryPolicy, SchedulerConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "outpost.toml";
const ENV_PREFIX: &str = "OUTPOST_";

/// Complete service configuration.
///
/// Loaded in priority order, highest first:
/// 1. Environment variables prefixed `OUTPOST_` (e.g. `OUTPOST_MAX_RETRY_ATTEMPTS`),
///    plus the unprefixed `DATABASE_URL`
/// 2. `outpost.toml` in the working directory
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum pooled connections.
    pub database_max_connections: u32,
    /// Minimum pooled connections.
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    pub database_connection_timeout: u64,

    // Dispatch
    /// Concurrent first-attempt workers.
    pub dispatch_worker_count: usize,
    /// Dispatch queue capacity.
    pub dispatch_queue_capacity: usize,

    // Retry
    /// Concurrent retry workers.
    pub retry_worker_count: usize,
    /// Retry queue capacity.
    pub retry_queue_capacity: usize,
    /// Seconds between scans of the store for due retries.
    pub retry_scan_interval_seconds: u64,
    /// Deliveries picked up per scan.
    pub retry_scan_batch_size: usize,
    /// Total attempts per delivery, including the first.
    pub max_retry_attempts: u32,
    /// First retry delay in milliseconds.
    pub retry_initial_delay_ms: u64,
    /// Backoff growth factor.
    pub retry_backoff_factor: f64,
    /// Retry delay cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Symmetric jitter fraction, 0.0 to 1.0.
    pub retry_jitter_factor: f64,

    // Circuit breaker
    /// Consecutive failures that open a circuit.
    pub circuit_breaker_failure_threshold: u32,
    /// Consecutive half-open successes that close it.
    pub circuit_breaker_success_threshold: u32,
    /// Seconds an open circuit blocks before probing.
    pub circuit_breaker_timeout_seconds: u64,

    // Client
    /// Per-attempt HTTP timeout in seconds.
    pub delivery_timeout_seconds: u64,
    /// Response bytes kept as failure detail.
    pub delivery_max_response_bytes: usize,
    /// User agent sent to subscribers.
    pub user_agent: String,
    /// Whether to verify subscriber TLS certificates.
    pub verify_tls: bool,

    /// Seconds to wait for in-flight work at shutdown.
    pub shutdown_timeout_seconds: u64,
}

impl Config {
    /// Loads defaults, then `outpost.toml`, then the environment.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Env::raw().only(&["DATABASE_URL"]));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine configuration assembled from the individual sections.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            circuit: self.to_circuit_config(),
            client: self.to_client_config(),
            retry: self.to_retry_policy(),
            scheduler: self.to_scheduler_config(),
            dispatcher: self.to_dispatcher_config(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Circuit breaker thresholds.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_breaker_timeout_seconds),
        }
    }

    /// HTTP client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: self.user_agent.clone(),
            verify_tls: self.verify_tls,
            max_response_body: self.delivery_max_response_bytes,
            ..ClientConfig::default()
        }
    }

    /// Backoff policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            backoff_factor: self.retry_backoff_factor,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Retry workers and scanner.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_count: self.retry_worker_count,
            queue_capacity: self.retry_queue_capacity,
            scan_interval: Duration::from_secs(self.retry_scan_interval_seconds),
            scan_batch_size: self.retry_scan_batch_size,
        }
    }

    /// Dispatch workers.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_count: self.dispatch_worker_count,
            queue_capacity: self.dispatch_queue_capacity,
        }
    }

    /// Database URL with the password masked, for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if self.database_url[..colon_pos].ends_with('/') {
                    return self.database_url.clone();
                }
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }
        if self.dispatch_worker_count == 0 || self.retry_worker_count == 0 {
            anyhow::bail!("worker counts must be greater than 0");
        }
        if self.dispatch_queue_capacity == 0 || self.retry_queue_capacity == 0 {
            anyhow::bail!("queue capacities must be greater than 0");
        }
        if self.retry_scan_interval_seconds == 0 || self.retry_scan_batch_size == 0 {
            anyhow::bail!("retry scan interval and batch size must be greater than 0");
        }
        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }
        if !(self.retry_backoff_factor.is_finite() && self.retry_backoff_factor > 0.0) {
            anyhow::bail!("retry_backoff_factor must be positive");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }
        if self.circuit_breaker_failure_threshold == 0 || self.circuit_breaker_success_threshold == 0 {
            anyhow::bail!("circuit breaker thresholds must be greater than 0");
        }
        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            database_url: "postgresql://localhost/outpost".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_connection_timeout: 10,
            dispatch_worker_count: engine.dispatcher.worker_count,
            dispatch_queue_capacity: engine.dispatcher.queue_capacity,
            retry_worker_count: engine.scheduler.worker_count,
            retry_queue_capacity: engine.scheduler.queue_capacity,
            retry_scan_interval_seconds: engine.scheduler.scan_interval.as_secs(),
            retry_scan_batch_size: engine.scheduler.scan_batch_size,
            max_retry_attempts: engine.retry.max_attempts,
            retry_initial_delay_ms: 1000,
            retry_backoff_factor: engine.retry.backoff_factor,
            retry_max_delay_ms: 300_000,
            retry_jitter_factor: engine.retry.jitter_factor,
            circuit_breaker_failure_threshold: engine.circuit.failure_threshold,
            circuit_breaker_success_threshold: engine.circuit.success_threshold,
            circuit_breaker_timeout_seconds: engine.circuit.recovery_timeout.as_secs(),
            delivery_timeout_seconds: engine.client.timeout.as_secs(),
            delivery_max_response_bytes: engine.client.max_response_body,
            user_agent: engine.client.user_agent,
            verify_tls: engine.client.verify_tls,
            shutdown_timeout_seconds: engine.shutdown_timeout.as_secs(),
        }
    }
}
