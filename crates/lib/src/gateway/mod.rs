//! Gateway: HTTP ingress for email webhooks.
//!
//! Single route, `POST /webhook`. Admission (rate limit, decode, transform) runs inline;
//! the downstream call runs detached so the response never waits on it.

mod server;

pub use server::{router, run_gateway, serve, GatewayState};
