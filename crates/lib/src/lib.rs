//! mailhook core library — webhook ingress, admission, dispatch to the downstream agent,
//! and outcome telemetry. Used by the `mailhook` CLI.

pub mod config;
pub mod dispatch;
pub mod email;
pub mod gateway;
pub mod init;
pub mod ratelimit;
pub mod telemetry;
