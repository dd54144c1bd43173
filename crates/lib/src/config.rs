//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.mailhook/config.json`) and environment.
//! Downstream and telemetry credentials are resolved at call time so environment
//! overrides take effect without a restart.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Downstream agent endpoint and credentials.
    #[serde(default)]
    pub downstream: DownstreamConfig,

    /// Telemetry collector endpoint and credentials.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Admission token bucket.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Bind address and port for the webhook listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP (default 8080).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0"; webhook providers must be able to reach it).
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

/// Downstream agent settings. Endpoint and key are overridden by
/// LLAMA_CLOUD_API_ENDPOINT and LLAMA_CLOUD_API_KEY.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Budget for the whole outbound call, connect through response (default 800, minimum 1).
    #[serde(default = "default_downstream_timeout_secs")]
    pub timeout_secs: u64,
}

/// Telemetry collector settings. Endpoint and key are overridden by
/// POSTHOG_ENDPOINT and POSTHOG_API_KEY.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Per-record delivery budget (default 10, minimum 1).
    #[serde(default = "default_telemetry_timeout_secs")]
    pub timeout_secs: u64,
}

/// Token bucket parameters; defaults admit one request per second with no burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_capacity")]
    pub capacity: u32,
    #[serde(default = "default_rate_limit_refill")]
    pub refill_per_second: f64,
}

fn default_server_port() -> u16 {
    8080
}

fn default_server_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_downstream_timeout_secs() -> u64 {
    800
}

fn default_telemetry_timeout_secs() -> u64 {
    10
}

fn default_rate_limit_capacity() -> u32 {
    1
}

fn default_rate_limit_refill() -> f64 {
    1.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
        }
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_downstream_timeout_secs(),
        }
    }
}

impl DownstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_telemetry_timeout_secs(),
        }
    }
}

impl TelemetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_limit_capacity(),
            refill_per_second: default_rate_limit_refill(),
        }
    }
}

/// Source of environment overrides. [`process_env`] in production; tests pass [`no_env`].
pub type EnvLookup = fn(&str) -> Option<String>;

/// Reads the process environment.
pub fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Reports every variable as unset.
pub fn no_env(_var: &str) -> Option<String> {
    None
}

/// Env var wins when set and non-blank; otherwise the trimmed config value, if non-blank.
fn env_or_config(env: EnvLookup, var: &str, configured: Option<&String>) -> Option<String> {
    env(var)
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the downstream agent URL: LLAMA_CLOUD_API_ENDPOINT overrides config.
pub fn resolve_downstream_endpoint_with(config: &Config, env: EnvLookup) -> Option<String> {
    env_or_config(env, "LLAMA_CLOUD_API_ENDPOINT", config.downstream.endpoint.as_ref())
}

/// Resolve the downstream bearer token: LLAMA_CLOUD_API_KEY overrides config.
pub fn resolve_downstream_api_key_with(config: &Config, env: EnvLookup) -> Option<String> {
    env_or_config(env, "LLAMA_CLOUD_API_KEY", config.downstream.api_key.as_ref())
}

pub fn resolve_downstream_endpoint(config: &Config) -> Option<String> {
    resolve_downstream_endpoint_with(config, process_env)
}

pub fn resolve_downstream_api_key(config: &Config) -> Option<String> {
    resolve_downstream_api_key_with(config, process_env)
}

/// Resolve the telemetry collector URL: env POSTHOG_ENDPOINT overrides config.
pub fn resolve_telemetry_endpoint(config: &Config) -> Option<String> {
    env_or_config(process_env, "POSTHOG_ENDPOINT", config.telemetry.endpoint.as_ref())
}

/// Resolve the telemetry project key: env POSTHOG_API_KEY overrides config.
pub fn resolve_telemetry_api_key(config: &Config) -> Option<String> {
    env_or_config(process_env, "POSTHOG_API_KEY", config.telemetry.api_key.as_ref())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("MAILHOOK_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".mailhook").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, MAILHOOK_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
