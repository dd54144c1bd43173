//! Gateway HTTP server and webhook handler.

use crate::config::{Config, EnvLookup};
use crate::dispatch::Dispatcher;
use crate::email::{self, InboundEvent};
use crate::ratelimit::RateLimiter;
use crate::telemetry::{OutcomeRecord, Telemetry};
use anyhow::{Context, Result};
use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Router};
use std::sync::Arc;
use std::time::Instant;

/// Shared state for the gateway. The rate limiter is built once and shared by every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub limiter: Arc<RateLimiter>,
    pub telemetry: Telemetry,
    pub dispatcher: Dispatcher,
}

impl GatewayState {
    pub fn new(config: Config, telemetry: Telemetry) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        Self {
            limiter,
            dispatcher: Dispatcher::new(Arc::new(config), telemetry.clone()),
            telemetry,
        }
    }

    /// Read downstream overrides from `env` instead of the process environment.
    pub fn with_env_lookup(mut self, env: EnvLookup) -> Self {
        self.dispatcher = self.dispatcher.with_env_lookup(env);
        self
    }
}

/// Router with the webhook route bound to `state`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .with_state(state)
}

/// Run the gateway server; binds to config.server.bind:config.server.port.
/// Blocks until shutdown (e.g. Ctrl+C). Dispatches still in flight at shutdown are abandoned.
pub async fn run_gateway(config: Config, telemetry: Telemetry) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let state = GatewayState::new(config, telemetry);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);
    serve(listener, state).await
}

/// Serve the webhook route on an already-bound listener until shutdown.
pub async fn serve(listener: tokio::net::TcpListener, state: GatewayState) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

/// POST /webhook — admits, decodes and transforms an email notification, then answers
/// without waiting on telemetry or the downstream call. Both run on background tasks.
async fn webhook(State(state): State<GatewayState>, body: Bytes) -> StatusCode {
    let start = Instant::now();

    if !state.limiter.allow() {
        log::warn!("too many requests, bounced");
        state
            .telemetry
            .emit_detached(OutcomeRecord::rate_limited(start.elapsed()));
        return StatusCode::TOO_MANY_REQUESTS;
    }

    let event = match InboundEvent::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("failed to decode webhook body: {}", e);
            state
                .telemetry
                .emit_detached(OutcomeRecord::decode_failed(start.elapsed(), e.to_string()));
            return StatusCode::BAD_REQUEST;
        }
    };

    let received = OutcomeRecord::email_received(
        &event.data.email_id,
        &event.data.from,
        start.elapsed(),
    );

    let payload = match email::transform(&event).to_vec() {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            log::error!("failed to serialize agent request: {}", e);
            let telemetry = state.telemetry.clone();
            let failed = OutcomeRecord::request_failed("marshalError", start.elapsed(), e.to_string());
            tokio::spawn(async move {
                telemetry.emit(received).await;
                telemetry.emit(failed).await;
            });
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    log::debug!("dispatching email {} to downstream agent", event.data.email_id);
    // emailReceived is recorded before the dispatch starts; the task owns the payload.
    let telemetry = state.telemetry.clone();
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        telemetry.emit(received).await;
        dispatcher.dispatch(payload).await;
    });
    StatusCode::NO_CONTENT
}
