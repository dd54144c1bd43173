//! Outcome telemetry: one record per terminal decision, delivered best-effort to an analytics sink.
//!
//! The sink is optional. Delivery errors are logged at the call site and never reach the
//! webhook response or the dispatch result.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, Config};

/// Event name reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEvent {
    RateLimitExceeded,
    FailedToRead,
    EmailReceived,
    RequestFailed,
    ResponseError,
    ResponseSuccess,
}

impl OutcomeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeEvent::RateLimitExceeded => "rateLimitExceeded",
            OutcomeEvent::FailedToRead => "failedToRead",
            OutcomeEvent::EmailReceived => "emailReceived",
            OutcomeEvent::RequestFailed => "requestFailed",
            OutcomeEvent::ResponseError => "responseError",
            OutcomeEvent::ResponseSuccess => "responseSuccess",
        }
    }
}

/// Synthetic subject ids for outcomes not keyed by an email.
pub const SUBJECT_TOO_MANY_REQUESTS: &str = "tooManyRequests";
pub const SUBJECT_EMAIL_RECEIVED_FAILURE: &str = "emailReceivedFailure";
pub const SUBJECT_REQUEST_TO_AGENT: &str = "requestToLlamaAgent";
pub const SUBJECT_RESPONSE_FROM_AGENT: &str = "responseFromLlamaAgent";

/// One terminal outcome. Built at the decision point, handed to the sink, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    /// Email id, or one of the `SUBJECT_*` categories.
    pub subject: String,
    pub event: OutcomeEvent,
    pub sub_type: String,
    pub latency_ms: u64,
    pub failed: bool,
    pub reason: Option<String>,
}

fn millis(latency: Duration) -> u64 {
    latency.as_millis().min(u64::MAX as u128) as u64
}

impl OutcomeRecord {
    pub fn rate_limited(latency: Duration) -> Self {
        Self {
            subject: SUBJECT_TOO_MANY_REQUESTS.to_string(),
            event: OutcomeEvent::RateLimitExceeded,
            sub_type: String::new(),
            latency_ms: millis(latency),
            failed: true,
            reason: Some("exceeded rate limit".to_string()),
        }
    }

    pub fn decode_failed(latency: Duration, reason: impl Into<String>) -> Self {
        Self {
            subject: SUBJECT_EMAIL_RECEIVED_FAILURE.to_string(),
            event: OutcomeEvent::FailedToRead,
            sub_type: "decodeError".to_string(),
            latency_ms: millis(latency),
            failed: true,
            reason: Some(reason.into()),
        }
    }

    pub fn email_received(email_id: &str, sender: &str, latency: Duration) -> Self {
        Self {
            subject: email_id.to_string(),
            event: OutcomeEvent::EmailReceived,
            sub_type: format!("emailBy{}", sender),
            latency_ms: millis(latency),
            failed: false,
            reason: None,
        }
    }

    /// `sub_type` names the failing step, e.g. "marshalError" or "failedToSendRequest".
    pub fn request_failed(sub_type: &str, latency: Duration, reason: impl Into<String>) -> Self {
        Self {
            subject: SUBJECT_REQUEST_TO_AGENT.to_string(),
            event: OutcomeEvent::RequestFailed,
            sub_type: sub_type.to_string(),
            latency_ms: millis(latency),
            failed: true,
            reason: Some(reason.into()),
        }
    }

    /// Status >= 400 is an error response; anything else is success.
    pub fn response(status: u16, latency: Duration) -> Self {
        let failed = status >= 400;
        Self {
            subject: SUBJECT_RESPONSE_FROM_AGENT.to_string(),
            event: if failed {
                OutcomeEvent::ResponseError
            } else {
                OutcomeEvent::ResponseSuccess
            },
            sub_type: format!("status{}", status),
            latency_ms: millis(latency),
            failed,
            reason: failed.then(|| "server returned an error status".to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telemetry collector returned {0}")]
    Status(reqwest::StatusCode),
}

/// Destination for outcome records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one record. Single attempt; callers log and discard errors.
    async fn record(&self, record: &OutcomeRecord) -> Result<(), TelemetryError>;
}

/// PostHog capture API sink (`POST <endpoint>/capture/`).
pub struct PosthogSink {
    endpoint: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl PosthogSink {
    pub fn new(endpoint: &str, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn capture_body(&self, record: &OutcomeRecord) -> serde_json::Value {
        let mut properties = json!({
            "eventType": record.sub_type,
            "latency": record.latency_ms,
            "isError": record.failed,
        });
        if let Some(ref reason) = record.reason {
            properties["failReason"] = serde_json::Value::String(reason.clone());
        }
        json!({
            "api_key": self.api_key,
            "event": record.event.as_str(),
            "distinct_id": record.subject,
            "properties": properties,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
impl TelemetrySink for PosthogSink {
    async fn record(&self, record: &OutcomeRecord) -> Result<(), TelemetryError> {
        let url = format!("{}/capture/", self.endpoint);
        let res = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&self.capture_body(record))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(TelemetryError::Status(res.status()));
        }
        Ok(())
    }
}

/// Call-site wrapper around an optional sink. Cheap to clone.
#[derive(Clone, Default)]
pub struct Telemetry {
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Records are dropped.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// PostHog sink when endpoint and key resolve; disabled otherwise.
    pub fn from_config(config: &Config) -> Self {
        match (
            config::resolve_telemetry_endpoint(config),
            config::resolve_telemetry_api_key(config),
        ) {
            (Some(endpoint), Some(key)) => {
                log::info!("telemetry enabled: {}", endpoint);
                Self::new(Arc::new(PosthogSink::new(
                    &endpoint,
                    key,
                    config.telemetry.timeout(),
                )))
            }
            _ => {
                log::info!("telemetry disabled (no endpoint or api key configured)");
                Self::disabled()
            }
        }
    }

    /// Deliver the record from a background task so the caller never waits on the sink.
    pub fn emit_detached(&self, record: OutcomeRecord) {
        let this = self.clone();
        tokio::spawn(async move { this.emit(record).await });
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver the record if a sink is configured. Never fails.
    pub async fn emit(&self, record: OutcomeRecord) {
        let Some(ref sink) = self.sink else {
            log::debug!(
                "telemetry disabled, dropping {} for {}",
                record.event.as_str(),
                record.subject
            );
            return;
        };
        if let Err(e) = sink.record(&record).await {
            log::warn!(
                "failed to send {} event for {}: {}",
                record.event.as_str(),
                record.subject,
                e
            );
        }
    }
}
