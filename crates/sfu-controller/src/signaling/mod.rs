//! Signaling Gateway.
//!
//! - [`protocol`] - JSON request, response and notification frames
//! - [`gateway`] - per-connection session state and request dispatch
//! - [`ws`] - axum WebSocket endpoint driving sessions

pub mod gateway;
pub mod protocol;
pub mod ws;

pub use gateway::{SignalingGateway, SignalingSession};
pub use protocol::{Request, ServerMessage};
pub use ws::{ConnectionLimits, SignalingServer};
