//! Protocol frame types for tunnel communication.
//!
//! Defines the JSON frames exchanged with the relay:
//! - [`InboundFrame`] - Endpoint announcements and proxied requests from the relay
//! - [`ProxiedResponse`] - Correlated responses sent back by the client
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
