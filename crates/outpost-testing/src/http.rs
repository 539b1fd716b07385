//! HTTP mocking utilities for webhook testing.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// HTTP mock server standing in for subscriber endpoints.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a new mock server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Absolute URL for `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    /// Answers every POST to `path` with `status`.
    pub async fn mock_status(&self, path_str: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(path_str))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Answers POSTs to `path` with `status` after `delay`.
    pub async fn mock_delayed(&self, path_str: &str, status: u16, delay: Duration) {
        Mock::given(method("POST"))
            .and(path(path_str))
            .respond_with(ResponseTemplate::new(status).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    /// Answers POSTs to `path` with a body.
    pub async fn mock_body(&self, path_str: &str, status: u16, body: impl Into<String>) {
        Mock::given(method("POST"))
            .and(path(path_str))
            .respond_with(ResponseTemplate::new(status).set_body_string(body.into()))
            .mount(&self.server)
            .await;
    }

    /// Starts a sequence of one-shot responses for `path`.
    pub fn mock_sequence<'a>(&'a self, path_str: &str) -> MockSequenceBuilder<'a> {
        MockSequenceBuilder { server: &self.server, path: path_str.to_string(), statuses: Vec::new(), fallback: None }
    }

    /// Every request received so far, oldest first.
    pub async fn received_requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| RecordedRequest {
                method: request.method.to_string(),
                path: request.url.path().to_string(),
                headers: request.headers,
                body: Bytes::from(request.body),
            })
            .collect()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Polls until at least `expected` requests arrived or `timeout` passed.
    /// Returns the final count.
    pub async fn wait_for_requests(&self, expected: usize, timeout: Duration) -> usize {
        let started = Instant::now();
        loop {
            let count = self.request_count().await;
            if count >= expected || started.elapsed() >= timeout {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A request captured by [`MockServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw body.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Body parsed as JSON.
    ///
    /// # Panics
    ///
    /// Panics if the body is not JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("request body is not valid JSON")
    }
}

/// Builder for response sequences. Each status answers exactly one request,
/// in order; the fallback answers everything after.
pub struct MockSequenceBuilder<'a> {
    server: &'a WiremockServer,
    path: String,
    statuses: Vec<u16>,
    fallback: Option<u16>,
}

impl MockSequenceBuilder<'_> {
    /// Adds a one-shot response.
    #[must_use]
    pub fn respond_with(mut self, status: u16) -> Self {
        self.statuses.push(status);
        self
    }

    /// Adds `times` one-shot responses with the same status.
    #[must_use]
    pub fn respond_times(mut self, status: u16, times: usize) -> Self {
        self.statuses.extend(std::iter::repeat(status).take(times));
        self
    }

    /// Status for every request after the sequence is used up.
    #[must_use]
    pub fn then_always(mut self, status: u16) -> Self {
        self.fallback = Some(status);
        self
    }

    /// Mounts the sequence.
    pub async fn build(self) {
        for status in self.statuses {
            Mock::given(method("POST"))
                .and(path(self.path.as_str()))
                .respond_with(ResponseTemplate::new(status))
                .up_to_n_times(1)
                .mount(self.server)
                .await;
        }
        if let Some(status) = self.fallback {
            Mock::given(method("POST"))
                .and(path(self.path.as_str()))
                .respond_with(ResponseTemplate::new(status))
                .mount(self.server)
                .await;
        }
    }
}

/// HTTP assertions for webhook testing.
pub mod assertions {
    use super::RecordedRequest;

    /// Asserts that a request carries `key: value`.
    pub fn assert_header_present(request: &RecordedRequest, key: &str, value: &str) {
        let actual = request.header(key).unwrap_or_else(|| panic!("header '{key}' not present"));
        assert_eq!(actual, value, "header '{key}' has unexpected value");
    }

    /// Asserts that a request does not carry `key`.
    pub fn assert_header_absent(request: &RecordedRequest, key: &str) {
        assert!(request.headers.get(key).is_none(), "header '{key}' unexpectedly present");
    }
}
