//! SFU Controller Library
//!
//! Control plane of a selective forwarding unit: a WebSocket signaling broker
//! that lets clients create and join rooms and negotiate WebRTC transports,
//! producers and consumers. All media handling is delegated to an external
//! [`engine::MediaEngine`]; the controller only keeps the session registry
//! and relays negotiation parameters.
//!
//! # Architecture
//!
//! ```text
//! WebSocket connection ──> SignalingSession ──> RoomRegistryActor
//!                                  │                  └── RoomActor (one per room)
//!                                  │                        └── MediaEngine calls
//!                                  └── outbound queue <── newProducer broadcasts
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Room registry and per-room actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine contract, mock and mediasoup implementations
//! - [`errors`] - Error types with signaling error codes
//! - [`ids`] - Room and connection identifiers
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - Wire protocol, per-connection sessions and WebSocket server

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ids;
pub mod observability;
pub mod signaling;
