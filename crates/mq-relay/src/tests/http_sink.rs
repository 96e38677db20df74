//! HTTP sink against a local server, alone and behind the relay.

use super::harness::{test_config, wait_until, RunningRelay, QUEUE};
use crate::config::{ContentMode, RelayConfig};
use crate::envelope::StructuredEvent;
use crate::error::RelayError;
use crate::memory_queue::InMemoryQueueManager;
use crate::sink::{EventSink, HttpSink};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn event(data: &[u8]) -> StructuredEvent {
    StructuredEvent {
        id: "414d5120514d31202020202020202020".to_string(),
        event_type: "dev.triggermesh.eventing.ibm-mq".to_string(),
        source: "localhost(1414)".to_string(),
        data: data.to_vec(),
    }
}

fn sink(server: &MockServer, mode: ContentMode) -> HttpSink {
    HttpSink::new(server.uri(), mode, Duration::from_secs(5)).unwrap()
}

/// Answer every POST to `/` with `status`.
async fn server_answering(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(status).set_body_string("rejected"))
        .mount(&server)
        .await;
    server
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

async fn requests(server: &MockServer) -> Vec<Request> {
    server.received_requests().await.unwrap_or_default()
}

#[tokio::test]
async fn binary_mode_posts_headers_and_raw_body() {
    let server = server_answering(200).await;
    let payload = [0x00, 0x7f, 0x80, 0xff, b'{'];

    sink(&server, ContentMode::Binary)
        .send(&event(&payload))
        .await
        .unwrap();

    let requests = requests(&server).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method.as_str(), "POST");
    assert_eq!(header(request, "ce-specversion"), Some("1.0"));
    assert_eq!(header(request, "ce-id"), Some("414d5120514d31202020202020202020"));
    assert_eq!(header(request, "ce-type"), Some("dev.triggermesh.eventing.ibm-mq"));
    assert_eq!(header(request, "ce-source"), Some("localhost(1414)"));
    assert!(header(request, "ce-time").is_some());
    assert_eq!(header(request, "content-type"), Some("application/octet-stream"));
    assert_eq!(request.body, payload.to_vec());
}

#[tokio::test]
async fn structured_mode_posts_json_document() {
    let server = server_answering(202).await;

    sink(&server, ContentMode::Structured)
        .send(&event(b"not json"))
        .await
        .unwrap();

    let requests = requests(&server).await;
    let request = &requests[0];
    assert_eq!(
        header(request, "content-type"),
        Some("application/cloudevents+json")
    );
    assert!(header(request, "ce-id").is_none());

    let json: serde_json::Value = request.body_json().unwrap();
    assert_eq!(json["specversion"], "1.0");
    assert_eq!(json["id"], "414d5120514d31202020202020202020");
    assert_eq!(json["type"], "dev.triggermesh.eventing.ibm-mq");
    assert_eq!(json["source"], "localhost(1414)");
    let data = BASE64.decode(json["data_base64"].as_str().unwrap()).unwrap();
    assert_eq!(data, b"not json".to_vec());
}

#[tokio::test]
async fn non_success_status_is_a_sink_error() {
    let server = server_answering(500).await;

    let err = sink(&server, ContentMode::Binary)
        .send(&event(b"x"))
        .await
        .unwrap_err();

    match err {
        RelayError::Sink { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "rejected");
        }
        other => panic!("expected a sink error, got {:?}", other),
    }
}

#[tokio::test]
async fn unreachable_sink_is_a_transport_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sink = HttpSink::new(
        format!("http://{}/", addr),
        ContentMode::Binary,
        Duration::from_secs(2),
    )
    .unwrap();

    let err = sink.send(&event(b"x")).await.unwrap_err();
    assert!(matches!(err, RelayError::Http(_)));
}

/// End to end: accepted posts commit, a rejected post backs out and is retried.
#[tokio::test]
async fn relay_commits_only_after_sink_accepts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = RelayConfig {
        sink: server.uri(),
        ..test_config(1)
    };
    let http = HttpSink::from_config(&config).unwrap();

    let qm = InMemoryQueueManager::new(QUEUE);
    let id = qm.put_source(b"hello sink".to_vec());
    let relay = RunningRelay::start(config, qm.clone(), Arc::new(http));

    assert!(wait_until(Duration::from_secs(5), || qm.commit_count() == 1).await);
    let snapshot = relay.stop().await.unwrap();

    assert_eq!(snapshot.backed_out, 1);
    assert_eq!(snapshot.committed, 1);
    assert_eq!(qm.depth(QUEUE), 0);

    let requests = requests(&server).await;
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(header(request, "ce-id"), Some(id.as_str()));
        assert_eq!(header(request, "ce-source"), Some("localhost(1414)"));
        assert_eq!(request.body, b"hello sink".to_vec());
    }
}
