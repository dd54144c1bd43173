//! Background delivery of the transformed request to the downstream agent.
//!
//! Each dispatch is one attempt under a wall-clock budget. Every exit path emits exactly one
//! outcome record; nothing is retried.

use axum::body::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{self, Config, EnvLookup};
use crate::telemetry::{OutcomeRecord, Telemetry};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("missing configuration: downstream endpoint and api key are required")]
    MissingConfiguration,
    #[error("failed to create request: {0}")]
    Build(reqwest::Error),
    #[error("failed to send request: {0}")]
    Transport(reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// Telemetry sub-type for this failure.
    pub fn sub_type(&self) -> &'static str {
        match self {
            DispatchError::MissingConfiguration => "missingEnvVariables",
            DispatchError::Build(_) => "failedToCreateRequest",
            DispatchError::Transport(_) | DispatchError::Timeout(_) => "failedToSendRequest",
        }
    }
}

/// Terminal state of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    ConfigMissing,
    RequestBuildFailed,
    TransportFailed,
    DownstreamError(u16),
    DownstreamSuccess(u16),
}

impl DispatchOutcome {
    fn from_error(e: &DispatchError) -> Self {
        match e {
            DispatchError::MissingConfiguration => DispatchOutcome::ConfigMissing,
            DispatchError::Build(_) => DispatchOutcome::RequestBuildFailed,
            DispatchError::Transport(_) | DispatchError::Timeout(_) => {
                DispatchOutcome::TransportFailed
            }
        }
    }
}

/// Sends serialized agent requests downstream. Cheap to clone; clones share the HTTP client.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    env: EnvLookup,
    client: reqwest::Client,
    telemetry: Telemetry,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, telemetry: Telemetry) -> Self {
        Self {
            config,
            env: config::process_env,
            client: reqwest::Client::new(),
            telemetry,
        }
    }

    /// Replace where endpoint and key overrides are read from (the process environment by default).
    pub fn with_env_lookup(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Run one dispatch to completion and report its outcome.
    pub async fn dispatch(&self, body: Bytes) -> DispatchOutcome {
        let start = Instant::now();
        match self.send(body).await {
            Ok(status) => {
                let record = OutcomeRecord::response(status, start.elapsed());
                let outcome = if record.failed {
                    log::warn!("downstream agent returned error status: {}", status);
                    DispatchOutcome::DownstreamError(status)
                } else {
                    log::info!("email forwarded to downstream agent (status {})", status);
                    DispatchOutcome::DownstreamSuccess(status)
                };
                self.telemetry.emit(record).await;
                outcome
            }
            Err(e) => {
                log::warn!("dispatch failed: {}", e);
                self.telemetry
                    .emit(OutcomeRecord::request_failed(
                        e.sub_type(),
                        start.elapsed(),
                        e.to_string(),
                    ))
                    .await;
                DispatchOutcome::from_error(&e)
            }
        }
    }

    /// Resolve credentials, build, and execute. Returns the response status.
    async fn send(&self, body: Bytes) -> Result<u16, DispatchError> {
        let (endpoint, api_key) = match (
            config::resolve_downstream_endpoint_with(&self.config, self.env),
            config::resolve_downstream_api_key_with(&self.config, self.env),
        ) {
            (Some(endpoint), Some(key)) => (endpoint, key),
            _ => return Err(DispatchError::MissingConfiguration),
        };
        let budget = self.config.downstream.timeout();
        let request = self
            .client
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(budget)
            .body(body)
            .build()
            .map_err(DispatchError::Build)?;

        let res = tokio::time::timeout(budget, self.client.execute(request))
            .await
            .map_err(|_| DispatchError::Timeout(budget))?
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout(budget)
                } else {
                    DispatchError::Transport(e)
                }
            })?;
        Ok(res.status().as_u16())
    }
}
