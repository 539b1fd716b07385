//! HTTP executor for single delivery attempts.
//!
//! Performs exactly one signed POST and classifies the result. There is no
//! retry logic here; the scheduler decides what happens next.

use std::time::{Duration, Instant};

use bytes::Bytes;
use outpost_core::DeliveryId;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{sign_payload, SIGNATURE_HEADER},
};

/// Header naming the event type.
pub const EVENT_HEADER: &str = "X-Outpost-Event";
/// Header carrying the delivery identifier.
pub const DELIVERY_HEADER: &str = "X-Outpost-Delivery";
/// Header carrying the one-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Outpost-Attempt";

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// User-Agent header value.
    pub user_agent: String,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
    /// Whether TLS certificates are verified.
    pub verify_tls: bool,
    /// Response bytes kept as failure detail.
    pub max_response_body: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Outpost-Webhooks/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
            max_response_body: 1024 * 1024,
        }
    }
}

/// One attempt to send.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery the attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Event type tag.
    pub event_type: String,
    /// Target URL.
    pub url: String,
    /// Exact body bytes. The signature covers these.
    pub body: Bytes,
    /// Content-Type header value.
    pub content_type: String,
    /// Signing secret. Empty or absent means unsigned.
    pub secret: Option<String>,
    /// One-based attempt number.
    pub attempt: u32,
}

/// Classified result of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// 2xx response received.
    pub success: bool,
    /// Response status, zero when no response arrived.
    pub status_code: u16,
    /// Response body or error text, truncated.
    pub detail: String,
    /// Wall time spent on the attempt.
    pub duration: Duration,
    /// Error describing a failed attempt.
    pub error: Option<DeliveryError>,
}

impl AttemptOutcome {
    fn transport_failure(error: DeliveryError, duration: Duration) -> Self {
        Self { success: false, status_code: 0, detail: error.to_string(), duration, error: Some(error) }
    }

    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Pooled HTTP client for subscriber endpoints.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Builds a client.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] if reqwest rejects the
    /// settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Builds a client with default settings.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one attempt and classifies the result. Never returns an error;
    /// failures are described by the outcome.
    pub async fn deliver(&self, request: &DeliveryRequest) -> AttemptOutcome {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event_type = %request.event_type,
            url = %request.url,
            attempt = request.attempt
        );

        async move {
            let started = Instant::now();

            let mut http = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, &request.content_type)
                .header(EVENT_HEADER, &request.event_type)
                .header(DELIVERY_HEADER, request.delivery_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt.to_string())
                .body(request.body.clone());

            if let Some(secret) = request.secret.as_deref().filter(|s| !s.is_empty()) {
                match sign_payload(&request.body, secret) {
                    Ok(signature) => http = http.header(SIGNATURE_HEADER, signature),
                    Err(e) => return AttemptOutcome::transport_failure(e, started.elapsed()),
                }
            }

            let response = match http.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = started.elapsed();
                    let error = if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    };
                    warn!(duration_ms = duration.as_millis(), error = %error, "request failed");
                    return AttemptOutcome::transport_failure(error, duration);
                },
            };

            let status_code = response.status().as_u16();
            let success = response.status().is_success();
            let detail = self.read_body(response).await;
            let duration = started.elapsed();

            let error = match status_code {
                200..=299 => None,
                500..=599 => Some(DeliveryError::server_error(status_code, detail.clone())),
                _ => Some(DeliveryError::client_error(status_code, detail.clone())),
            };

            if success {
                debug!(status_code, duration_ms = duration.as_millis(), "delivered");
            } else {
                warn!(status_code, duration_ms = duration.as_millis(), "subscriber rejected delivery");
            }

            AttemptOutcome { success, status_code, detail, duration, error }
        }
        .instrument(span)
        .await
    }

    /// Reads at most `max_response_body` bytes of the response.
    async fn read_body(&self, mut response: Response) -> String {
        let cap = self.config.max_response_body;
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = cap.saturating_sub(body.len());
                    if chunk.len() > room {
                        body.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read response body");
                    return format!("[failed to read response body: {e}]");
                },
            }
        }

        let mut text = String::from_utf8_lossy(&body).into_owned();
        if truncated {
            text.push_str(TRUNCATION_SUFFIX);
        }
        text
    }
}
