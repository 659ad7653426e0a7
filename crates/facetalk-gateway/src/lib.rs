//! WebSocket gateway for live avatar conversations.
//!
//! One connection per session at `/ws/session/{session_id}`. Inbound JSON
//! frames are decoded and handed to the session registry; outbound events
//! are drained by a single writer task per connection so they reach the
//! client in the order the pipeline produced them.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
