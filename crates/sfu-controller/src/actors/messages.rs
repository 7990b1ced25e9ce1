//! Message types for actor communication.
//!
//! Every request carries a `respond_to` oneshot sender; the actor answers
//! exactly once.

use crate::engine::{
    ConsumerDescriptor, EngineEvent, MediaKind, RouterDescriptor, TransportDirection,
    TransportParameters,
};
use crate::errors::SfuError;
use crate::signaling::protocol::ServerMessage;

use super::room::RoomActorHandle;

use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// RoomRegistryActor Messages
// ============================================================================

/// Messages handled by the `RoomRegistryActor`.
pub enum RegistryMessage {
    /// Register a room whose router was already created by the engine.
    RegisterRoom {
        room_id: String,
        router: RouterDescriptor,
        events: mpsc::Receiver<EngineEvent>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Resolve a live room to its actor handle.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Sent by a room once its last peer left and its router is released.
    RoomClosed { room_id: String },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and tear down every live room.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Snapshot of registry state.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: String,
    pub peer_count: usize,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

// ============================================================================
// RoomActor Messages
// ============================================================================

/// Messages handled by a `RoomActor`.
pub enum RoomMessage {
    /// Admit a connection as a peer. Returns the router RTP capabilities.
    Join {
        connection_id: String,
        notifier: mpsc::Sender<ServerMessage>,
        respond_to: oneshot::Sender<Result<Value, SfuError>>,
    },

    CreateTransport {
        connection_id: String,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportParameters, SfuError>>,
    },

    ConnectTransport {
        connection_id: String,
        transport_id: String,
        dtls_parameters: Value,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Returns the new producer id.
    Produce {
        connection_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        respond_to: oneshot::Sender<Result<String, SfuError>>,
    },

    Consume {
        connection_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
        respond_to: oneshot::Sender<Result<ConsumerDescriptor, SfuError>>,
    },

    CloseProducer {
        connection_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Connection lost: release the peer's engine resources and drop it.
    PeerDisconnected {
        connection_id: String,
        respond_to: oneshot::Sender<()>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

impl RoomMessage {
    /// Answer the message with `error` without processing it.
    ///
    /// Used once a room has closed its mailbox or is shutting down.
    pub(crate) fn reject(self, error: impl Fn() -> SfuError) {
        match self {
            RoomMessage::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
            }
            RoomMessage::CreateTransport { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
            }
            RoomMessage::ConnectTransport { respond_to, .. }
            | RoomMessage::CloseProducer { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
            }
            RoomMessage::Produce { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
            }
            RoomMessage::Consume { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
            }
            // Nothing left to clean up in a closed room
            RoomMessage::PeerDisconnected { respond_to, .. } => {
                let _ = respond_to.send(());
            }
            // Dropping the sender surfaces as a receive error to the caller
            RoomMessage::GetState { .. } => {}
        }
    }
}

/// Snapshot of a room's registry records.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub router_id: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    pub peers: Vec<PeerInfo>,
}

impl RoomState {
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}

/// Records owned by one peer. Id lists are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub send_transports: Vec<String>,
    pub receive_transports: Vec<String>,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
}
