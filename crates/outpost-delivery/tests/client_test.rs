//! Integration tests for the HTTP delivery client.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use bytes::Bytes;
use outpost_core::DeliveryId;
use outpost_delivery::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest, ATTEMPT_HEADER, DELIVERY_HEADER, EVENT_HEADER},
    signing::{generate_hmac_hex, SIGNATURE_HEADER},
    DeliveryError,
};
use outpost_testing::{http::assertions, MockServer};

fn request(url: String) -> DeliveryRequest {
    DeliveryRequest {
        delivery_id: DeliveryId::new(),
        event_type: "document.created".to_string(),
        url,
        body: Bytes::from_static(br#"{"id":"evt_1","type":"document.created"}"#),
        content_type: "application/json".to_string(),
        secret: None,
        attempt: 1,
    }
}

#[tokio::test]
async fn sends_correlation_headers() {
    let server = MockServer::start().await;
    server.mock_status("/hook", 200).await;
    let client = DeliveryClient::with_defaults().expect("client");
    let mut req = request(server.endpoint("/hook"));
    req.attempt = 3;

    let outcome = client.deliver(&req).await;

    assert!(outcome.success);
    let received = server.received_requests().await;
    let sent = &received[0];
    assertions::assert_header_present(sent, EVENT_HEADER, "document.created");
    assertions::assert_header_present(sent, DELIVERY_HEADER, &req.delivery_id.to_string());
    assertions::assert_header_present(sent, ATTEMPT_HEADER, "3");
    assertions::assert_header_present(sent, "user-agent", "Outpost-Webhooks/1.0");
    assertions::assert_header_absent(sent, SIGNATURE_HEADER);
    assert_eq!(sent.body, req.body);
}

#[tokio::test]
async fn signs_exact_body_bytes() {
    let server = MockServer::start().await;
    server.mock_status("/hook", 202).await;
    let client = DeliveryClient::with_defaults().expect("client");
    let mut req = request(server.endpoint("/hook"));
    req.secret = Some("topsecret".to_string());

    client.deliver(&req).await;

    let received = server.received_requests().await;
    let expected = format!("sha256={}", generate_hmac_hex(&req.body, "topsecret").unwrap());
    assertions::assert_header_present(&received[0], SIGNATURE_HEADER, &expected);
}

#[tokio::test]
async fn empty_secret_is_unsigned() {
    let server = MockServer::start().await;
    server.mock_status("/hook", 200).await;
    let client = DeliveryClient::with_defaults().expect("client");
    let mut req = request(server.endpoint("/hook"));
    req.secret = Some(String::new());

    client.deliver(&req).await;

    assertions::assert_header_absent(&server.received_requests().await[0], SIGNATURE_HEADER);
}

#[tokio::test]
async fn custom_content_type_is_sent() {
    let server = MockServer::start().await;
    server.mock_status("/hook", 200).await;
    let client = DeliveryClient::with_defaults().expect("client");
    let mut req = request(server.endpoint("/hook"));
    req.content_type = "application/cloudevents+json".to_string();

    client.deliver(&req).await;

    assertions::assert_header_present(
        &server.received_requests().await[0],
        "content-type",
        "application/cloudevents+json",
    );
}

#[tokio::test]
async fn rejected_delivery_keeps_response_body() {
    let server = MockServer::start().await;
    server.mock_body("/hook", 422, "missing field").await;
    let client = DeliveryClient::with_defaults().expect("client");

    let outcome = client.deliver(&request(server.endpoint("/hook"))).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status_code, 422);
    assert_eq!(outcome.detail, "missing field");
    assert!(matches!(outcome.error, Some(DeliveryError::ClientError { status_code: 422, .. })));
}

#[tokio::test]
async fn slow_endpoint_times_out_without_status() {
    let server = MockServer::start().await;
    server.mock_delayed("/hook", 200, Duration::from_millis(500)).await;
    let config = ClientConfig { timeout: Duration::from_millis(50), ..ClientConfig::default() };
    let client = DeliveryClient::new(config).expect("client");

    let outcome = client.deliver(&request(server.endpoint("/hook"))).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status_code, 0);
    assert!(matches!(outcome.error, Some(DeliveryError::Timeout { .. })));
}
