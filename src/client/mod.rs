//! Tunnel client implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`TunnelClient`] - Connects to the relay and runs sessions
//! - `Session` - Per-connection state machine and frame dispatch
//! - [`RequestHandler`] - Pluggable mapping from proxied request to response
//! - HTTP forwarding to a local service

mod connection;
mod events;
mod handler;
mod http_proxy;
mod session;

pub use connection::{tunnel_url, ReconnectPolicy, TunnelClient};
pub use events::*;
pub use handler::{HelloWorld, RequestHandler};
pub use http_proxy::ForwardHandler;
pub use session::SessionOptions;
