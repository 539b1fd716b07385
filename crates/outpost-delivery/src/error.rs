//! Error types for delivery, scheduling, and operator operations.
//!
//! Delivery-level failures are recorded rather than returned from dispatch;
//! these variants surface through operator calls, attempt outcomes, and
//! metric labels.

use std::fmt;

use outpost_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the delivery engine.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection-level failure before a response arrived.
    #[error("network connection failed: {message}")]
    Network {
        /// Transport error description
        message: String,
    },

    /// Request exceeded the client timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// Subscriber answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Subscriber answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Circuit breaker denied the attempt.
    #[error("circuit breaker open for subscriber {subscriber_id}")]
    CircuitOpen {
        /// Subscriber whose circuit is open
        subscriber_id: String,
    },

    /// Attempt budget used up.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Durable store failure.
    #[error("database error: {message}")]
    Database {
        /// Store error description
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// Filter rejected at creation or update time.
    #[error("invalid filter at {path}: {message}")]
    InvalidFilter {
        /// Location of the offending node, e.g. `group.rules[0].operator`
        path: String,
        /// What is wrong
        message: String,
    },

    /// Work queue has no free capacity. The caller may try again later.
    #[error("work queue is full")]
    QueueFull,

    /// A retry for this delivery is already queued or running.
    #[error("retry already in progress for delivery {delivery_id}")]
    RetryInProgress {
        /// Delivery being retried
        delivery_id: String,
    },

    /// The delivery already succeeded.
    #[error("delivery {delivery_id} already succeeded")]
    AlreadyDelivered {
        /// Delivery in question
        delivery_id: String,
    },

    /// Referenced entity does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity
        what: String,
    },

    /// Engine has not been started.
    #[error("delivery engine not started")]
    NotStarted,

    /// Shutdown has begun and no new work is admitted.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Workers did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout_seconds: u64,
    },

    /// A worker task panicked.
    #[error("worker panicked: {message}")]
    WorkerPanic {
        /// Join error description
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Error description
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a 4xx error.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a 5xx error.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(subscriber_id: impl ToString) -> Self {
        Self::CircuitOpen { subscriber_id: subscriber_id.to_string() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a filter validation error.
    pub fn invalid_filter(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilter { path: path.into(), message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the failure is transient.
    ///
    /// Transport failures, timeouts, 5xx responses, store outages, and a full
    /// queue are transient. Everything else needs a change before trying
    /// again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::Database { .. }
            | Self::QueueFull => true,

            Self::ClientError { status_code, .. } => *status_code == 429,

            Self::CircuitOpen { .. }
            | Self::RetriesExhausted { .. }
            | Self::Configuration { .. }
            | Self::InvalidFilter { .. }
            | Self::RetryInProgress { .. }
            | Self::AlreadyDelivered { .. }
            | Self::NotFound { .. }
            | Self::NotStarted
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Metric label for this error.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound(what) => Self::NotFound { what },
            CoreError::InvalidInput(message) => Self::Configuration { message },
            other => Self::database(other.to_string()),
        }
    }
}

/// Coarse classification of errors for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// 4xx responses and exhausted budgets.
    Client,
    /// 5xx responses.
    Server,
    /// Circuit breaker denials.
    Circuit,
    /// Durable store failures.
    Database,
    /// Invalid configuration or filters.
    Configuration,
    /// Queue and lifecycle conditions.
    Capacity,
    /// Everything else.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } | DeliveryError::RetriesExhausted { .. } => {
                Self::Client
            },
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::Database { .. } | DeliveryError::NotFound { .. } => Self::Database,
            DeliveryError::Configuration { .. } | DeliveryError::InvalidFilter { .. } => {
                Self::Configuration
            },
            DeliveryError::QueueFull
            | DeliveryError::RetryInProgress { .. }
            | DeliveryError::AlreadyDelivered { .. }
            | DeliveryError::NotStarted
            | DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. } => Self::Capacity,
            DeliveryError::WorkerPanic { .. } | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::Circuit => "circuit",
            Self::Database => "database",
            Self::Configuration => "configuration",
            Self::Capacity => "capacity",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}
