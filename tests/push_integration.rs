use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mockito::{Matcher, Server};
use serde_json::json;
use tokio::time::Instant;

use loki_shipper::batcher::{BatchConfig, Batcher};
use loki_shipper::client::{HttpPushClient, PUSH_PATH};
use loki_shipper::clock::SystemClock;
use loki_shipper::config::Credentials;
use loki_shipper::dispatcher::{BackpressureMode, Dispatcher, DispatcherConfig};
use loki_shipper::encoder::{decode, Encoder, PendingPayload};
use loki_shipper::entry::Entry;
use loki_shipper::sender::{
    DeliveryState, RetryConfig, Sender, Transport, TransportError,
};

fn entry(secs: i64, line: &str, app: &str) -> Entry {
    Entry::with_timestamp(
        Utc.timestamp_opt(secs, 0).unwrap(),
        line,
        [("app", app)],
    )
}

fn payload(entries: Vec<Entry>, compress: bool) -> PendingPayload {
    let now = Instant::now();
    let mut batcher = Batcher::new(BatchConfig::default(), now);
    for entry in entries {
        batcher.submit(entry, now).unwrap();
    }
    Encoder::new(compress).encode(batcher.drain(now)).unwrap()
}

fn client(server: &Server, tenant: Option<&str>, credentials: Credentials) -> HttpPushClient {
    HttpPushClient::with_settings(
        format!("{}{}", server.url(), PUSH_PATH),
        Duration::from_secs(5),
        tenant,
        credentials,
    )
    .expect("failed to create client")
}

#[tokio::test]
async fn push_sends_json_body_with_tenant_and_auth() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .match_header("content-type", "application/json")
        .match_header("x-scope-orgid", "tenant-1")
        .match_header("authorization", "Basic YWRtaW46c2VjcmV0")
        .match_header("content-encoding", Matcher::Missing)
        .match_body(Matcher::Json(json!({
            "streams": [{
                "stream": {"app": "foo"},
                "values": [
                    ["1700000000000000000", "first"],
                    ["1700000001000000000", "second"]
                ]
            }]
        })))
        .with_status(204)
        .create_async()
        .await;

    let client = client(
        &server,
        Some("tenant-1"),
        Credentials::Basic {
            username: "admin".into(),
            password: Some("secret".into()),
        },
    );
    let payload = payload(
        vec![
            entry(1_700_000_000, "first", "foo"),
            entry(1_700_000_001, "second", "foo"),
        ],
        false,
    );

    let response = client.push(&payload).await.expect("push failed");
    assert_eq!(response.status.as_u16(), 204);
    mock.assert_async().await;
}

#[tokio::test]
async fn push_compresses_large_payloads() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .match_header("content-encoding", "gzip")
        .with_status(204)
        .create_async()
        .await;

    let entries = (0..200)
        .map(|i| entry(1_700_000_000 + i, "GET /api/v1/items 200 12ms", "api"))
        .collect();
    let payload = payload(entries, true);
    assert!(payload.encoded_len() < payload.uncompressed_len());

    let decoded = decode(payload.body(), payload.content_encoding()).unwrap();
    assert_eq!(decoded[0].entries.len(), 200);

    client(&server, None, Credentials::None)
        .push(&payload)
        .await
        .expect("push failed");
    mock.assert_async().await;
}

#[tokio::test]
async fn rate_limit_response_carries_retry_after() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", PUSH_PATH)
        .with_status(429)
        .with_header("retry-after", "3")
        .with_body("ingestion rate limit exceeded")
        .create_async()
        .await;

    let response = client(&server, None, Credentials::None)
        .push(&payload(vec![entry(1_700_000_000, "x", "foo")], false))
        .await
        .expect("push failed");

    assert_eq!(response.status.as_u16(), 429);
    assert_eq!(response.retry_after, Some(Duration::from_secs(3)));
    assert_eq!(response.body, "ingestion rate limit exceeded");
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .with_status(400)
        .with_body("entry too far behind")
        .expect(1)
        .create_async()
        .await;

    let sender = Sender::new(
        Arc::new(client(&server, None, Credentials::None)),
        Arc::new(SystemClock),
        RetryConfig::default(),
    );
    let report = sender
        .deliver(payload(vec![entry(1_700_000_000, "x", "foo")], false))
        .await;

    mock.assert_async().await;
    assert_eq!(report.attempts, 1);
    match report.state {
        DeliveryState::Failed { reason } => assert!(reason.contains("entry too far behind")),
        other => panic!("unexpected state: {:?}", other),
    }
}

#[tokio::test]
async fn refused_connection_is_a_transport_error() {
    let client = HttpPushClient::with_settings(
        format!("http://127.0.0.1:1{}", PUSH_PATH),
        Duration::from_secs(2),
        None,
        Credentials::None,
    )
    .unwrap();

    let err = client
        .push(&payload(vec![entry(1_700_000_000, "x", "foo")], false))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connect(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn dispatcher_delivers_to_server_on_shutdown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .match_body(Matcher::Json(json!({
            "streams": [
                {"stream": {"app": "bar"}, "values": [["1700000002000000000", "b1"]]},
                {"stream": {"app": "foo"}, "values": [
                    ["1700000000000000000", "f1"],
                    ["1700000001000000000", "f2"]
                ]}
            ]
        })))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = DispatcherConfig {
        backpressure: BackpressureMode::Error,
        compression: false,
        workers: 1,
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(client(&server, None, Credentials::None)),
    );
    dispatcher.start().unwrap();

    dispatcher.enqueue(entry(1_700_000_000, "f1", "foo")).await.unwrap();
    dispatcher.enqueue(entry(1_700_000_001, "f2", "foo")).await.unwrap();
    dispatcher.enqueue(entry(1_700_000_002, "b1", "bar")).await.unwrap();

    let report = dispatcher.shutdown(Duration::from_secs(5)).await;

    mock.assert_async().await;
    assert!(report.completed);
    assert_eq!(report.pending_entries, 3);
    assert_eq!(report.metrics.entries_delivered, 3);
    assert_eq!(report.metrics.payloads_delivered, 1);
}
