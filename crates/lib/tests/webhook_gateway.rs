//! Integration tests: start the gateway on a free port and POST webhooks to it.
//! A local axum server stands in for the downstream agent and an in-memory sink for telemetry.
//! Downstream overrides are never read from the process environment here.
//! Server tasks are left running when each test ends.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use mailhook::config::Config;
use mailhook::config::no_env;
use mailhook::gateway::{self, GatewayState};
use mailhook::telemetry::{OutcomeEvent, OutcomeRecord, Telemetry, TelemetryError, TelemetrySink};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SCENARIO_BODY: &str =
    r#"{"type":"email.received","data":{"email_id":"e1","from":"a@x.com","subject":"hi"}}"#;

/// Collects records; with a non-zero `delay` every delivery stalls first, like a slow collector.
#[derive(Default)]
struct MemorySink {
    delay: Duration,
    records: Mutex<Vec<OutcomeRecord>>,
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn record(&self, record: &OutcomeRecord) -> Result<(), TelemetryError> {
        tokio::time::sleep(self.delay).await;
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

impl MemorySink {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn snapshot(&self) -> Vec<OutcomeRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Poll until at least `n` records arrived (or 5s pass).
    async fn wait_for(&self, n: usize) -> Vec<OutcomeRecord> {
        for _ in 0..100 {
            let records = self.snapshot();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.snapshot()
    }
}

/// What the fake downstream agent saw.
#[derive(Debug, Clone)]
struct Received {
    authorization: Option<String>,
    content_type: Option<String>,
    body: serde_json::Value,
}

struct Downstream {
    status: StatusCode,
    delay: Duration,
    received: Mutex<Vec<Received>>,
}

async fn downstream_handler(
    State(downstream): State<Arc<Downstream>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    downstream.received.lock().unwrap().push(Received {
        authorization: header("authorization"),
        content_type: header("content-type"),
        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
    });
    tokio::time::sleep(downstream.delay).await;
    downstream.status
}

/// Start a fake downstream agent on a free port; returns its state and endpoint URL.
async fn start_downstream(status: StatusCode, delay: Duration) -> (Arc<Downstream>, String) {
    let downstream = Arc::new(Downstream {
        status,
        delay,
        received: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/run", post(downstream_handler))
        .with_state(downstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind downstream");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (downstream, format!("http://{}/run", addr))
}

fn config_with_downstream(endpoint: Option<String>) -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.downstream.endpoint = endpoint;
    config.downstream.api_key = Some("agent-key".to_string());
    config
}

/// Start the gateway with an in-memory sink; returns the webhook URL.
async fn start_gateway(config: Config) -> (Arc<MemorySink>, String) {
    let sink = Arc::new(MemorySink::default());
    let url = start_gateway_with_sink(config, sink.clone()).await;
    (sink, url)
}

async fn start_gateway_with_sink(config: Config, sink: Arc<MemorySink>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("local_addr");
    let state = GatewayState::new(config, Telemetry::new(sink)).with_env_lookup(no_env);
    tokio::spawn(async move {
        let _ = gateway::serve(listener, state).await;
    });
    format!("http://{}/webhook", addr)
}

async fn post_webhook(url: &str, body: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .expect("POST /webhook")
}

fn events(records: &[OutcomeRecord]) -> Vec<OutcomeEvent> {
    records.iter().map(|r| r.event).collect()
}

#[tokio::test]
async fn well_formed_email_is_forwarded_to_agent() {
    let (downstream, endpoint) = start_downstream(StatusCode::OK, Duration::ZERO).await;
    let (sink, url) = start_gateway(config_with_downstream(Some(endpoint))).await;

    let res = post_webhook(&url, SCENARIO_BODY).await;
    assert_eq!(res.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(res.bytes().await.unwrap().is_empty());

    let records = sink.wait_for(2).await;
    assert_eq!(
        events(&records),
        vec![OutcomeEvent::EmailReceived, OutcomeEvent::ResponseSuccess]
    );
    assert_eq!(records[0].subject, "e1");
    assert!(!records[0].failed);
    assert_eq!(records[1].sub_type, "status200");
    assert!(!records[1].failed);

    let received = downstream.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].authorization.as_deref(), Some("Bearer agent-key"));
    assert_eq!(received[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(
        received[0].body,
        json!({
            "start_event": {"sender": "a@x.com", "subject": "hi", "email_id": "e1"},
            "context": {},
            "handler_id": ""
        })
    );
}

#[tokio::test]
async fn downstream_error_status_is_recorded_as_failure() {
    let (_downstream, endpoint) =
        start_downstream(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
    let (sink, url) = start_gateway(config_with_downstream(Some(endpoint))).await;

    let res = post_webhook(&url, SCENARIO_BODY).await;
    assert_eq!(res.status(), reqwest::StatusCode::NO_CONTENT);

    let records = sink.wait_for(2).await;
    assert_eq!(records.len(), 2);
    let last = &records[1];
    assert_eq!(last.event, OutcomeEvent::ResponseError);
    assert_eq!(last.sub_type, "status500");
    assert!(last.failed);
    assert_eq!(last.reason.as_deref(), Some("server returned an error status"));
}

#[tokio::test]
async fn response_does_not_wait_for_slow_agent() {
    let (downstream, endpoint) = start_downstream(StatusCode::OK, Duration::from_secs(5)).await;
    let mut config = config_with_downstream(Some(endpoint));
    config.downstream.timeout_secs = 1;
    let (sink, url) = start_gateway(config).await;

    let started = Instant::now();
    let res = post_webhook(&url, SCENARIO_BODY).await;
    assert_eq!(res.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "webhook response took {:?}",
        started.elapsed()
    );

    // the dispatch budget expires before the agent answers
    let records = sink.wait_for(2).await;
    assert_eq!(
        events(&records),
        vec![OutcomeEvent::EmailReceived, OutcomeEvent::RequestFailed]
    );
    assert_eq!(records[1].sub_type, "failedToSendRequest");
    assert!(records[1].failed);
    assert_eq!(downstream.received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_bodies_are_rejected_without_dispatch() {
    let (downstream, endpoint) = start_downstream(StatusCode::OK, Duration::ZERO).await;
    let mut config = config_with_downstream(Some(endpoint));
    config.rate_limit.capacity = 10;
    let (sink, url) = start_gateway(config).await;

    let bad_json = post_webhook(&url, "{not json").await;
    assert_eq!(bad_json.status(), reqwest::StatusCode::BAD_REQUEST);
    let missing_fields = post_webhook(&url, r#"{"type":"email.received","data":{"from":"a@x.com"}}"#).await;
    assert_eq!(missing_fields.status(), reqwest::StatusCode::BAD_REQUEST);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let records = sink.snapshot();
    assert_eq!(
        events(&records),
        vec![OutcomeEvent::FailedToRead, OutcomeEvent::FailedToRead]
    );
    assert!(records.iter().all(|r| r.failed && r.sub_type == "decodeError"));
    assert!(records.iter().all(|r| r.subject == "emailReceivedFailure"));
    assert!(downstream.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_request_in_same_second_is_rate_limited() {
    let (downstream, endpoint) = start_downstream(StatusCode::OK, Duration::ZERO).await;
    let (sink, url) = start_gateway(config_with_downstream(Some(endpoint))).await;

    let first = post_webhook(&url, SCENARIO_BODY).await;
    let second = post_webhook(&url, SCENARIO_BODY).await;
    assert_eq!(first.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);

    let records = sink.wait_for(3).await;
    let limited: Vec<_> = records
        .iter()
        .filter(|r| r.event == OutcomeEvent::RateLimitExceeded)
        .collect();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].subject, "tooManyRequests");
    assert!(limited[0].failed);
    assert_eq!(downstream.received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_downstream_endpoint_fails_dispatch() {
    let (sink, url) = start_gateway(config_with_downstream(None)).await;

    let res = post_webhook(&url, SCENARIO_BODY).await;
    assert_eq!(res.status(), reqwest::StatusCode::NO_CONTENT);

    let records = sink.wait_for(2).await;
    assert_eq!(
        events(&records),
        vec![OutcomeEvent::EmailReceived, OutcomeEvent::RequestFailed]
    );
    assert_eq!(records[1].subject, "requestToLlamaAgent");
    assert_eq!(records[1].sub_type, "missingEnvVariables");
    assert!(records[1].failed);
    assert!(records[1]
        .reason
        .as_deref()
        .unwrap()
        .starts_with("missing configuration"));
}

#[tokio::test]
async fn missing_api_key_never_reaches_running_agent() {
    let (downstream, endpoint) = start_downstream(StatusCode::OK, Duration::ZERO).await;
    let mut config = config_with_downstream(Some(endpoint));
    config.downstream.api_key = None;
    let (sink, url) = start_gateway(config).await;

    let res = post_webhook(&url, SCENARIO_BODY).await;
    assert_eq!(res.status(), reqwest::StatusCode::NO_CONTENT);

    sink.wait_for(2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let records = sink.snapshot();
    assert_eq!(
        events(&records),
        vec![OutcomeEvent::EmailReceived, OutcomeEvent::RequestFailed]
    );
    assert_eq!(records[1].sub_type, "missingEnvVariables");
    assert!(downstream.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn responses_do_not_wait_for_slow_telemetry() {
    let (downstream, endpoint) = start_downstream(StatusCode::OK, Duration::ZERO).await;
    let mut config = config_with_downstream(Some(endpoint));
    config.rate_limit.capacity = 2;
    config.rate_limit.refill_per_second = 0.01;
    let sink = Arc::new(MemorySink::slow(Duration::from_secs(3)));
    let url = start_gateway_with_sink(config, sink.clone()).await;

    let cases = [
        (SCENARIO_BODY, reqwest::StatusCode::NO_CONTENT),
        ("{bad", reqwest::StatusCode::BAD_REQUEST),
        (SCENARIO_BODY, reqwest::StatusCode::TOO_MANY_REQUESTS),
    ];
    for (body, expected) in cases {
        let started = Instant::now();
        let res = post_webhook(&url, body).await;
        assert_eq!(res.status(), expected);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "{} response took {:?}",
            expected,
            started.elapsed()
        );
    }

    // records land once the sink's delay has passed
    let records = sink.wait_for(3).await;
    let seen = events(&records);
    assert!(seen.contains(&OutcomeEvent::EmailReceived));
    assert!(seen.contains(&OutcomeEvent::FailedToRead));
    assert!(seen.contains(&OutcomeEvent::RateLimitExceeded));

    // the admitted email is dispatched after its emailReceived record
    for _ in 0..40 {
        if !downstream.received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(downstream.received.lock().unwrap().len(), 1);
}
