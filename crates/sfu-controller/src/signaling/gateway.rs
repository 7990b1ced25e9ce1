//! Signaling gateway: per-connection request dispatch.
//!
//! A [`SignalingSession`] exists for each duplex connection. It owns the
//! connection id, the outbound notifier handed to its room, and the
//! connection's room binding:
//!
//! ```text
//! Unbound --joinRoom--> Bound(room) --disconnect--> Terminated
//! ```
//!
//! Room-scoped requests in `Unbound` fail with `NoBoundRoom`. The session is
//! transport agnostic; `signaling::ws` drives it from a WebSocket.

use crate::actors::{ActorMetrics, RoomActorHandle, RoomRegistryHandle};
use crate::engine::TransportDirection;
use crate::errors::SfuError;
use crate::ids;
use crate::observability::metrics;

use super::protocol::{
    decode_frame, ConsumeMediaResponse, CreateRoomResponse, JoinRoomResponse,
    ProduceMediaResponse, Request, ServerMessage, TransportCreatedResponse,
};

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Entry point shared by every connection.
#[derive(Clone)]
pub struct SignalingGateway {
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
}

impl SignalingGateway {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, metrics: Arc<ActorMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Start a session for a newly accepted connection.
    ///
    /// `notifier` receives unsolicited notifications for this connection.
    #[must_use]
    pub fn open_session(&self, notifier: mpsc::Sender<ServerMessage>) -> SignalingSession {
        let connection_id = ids::new_connection_id();
        self.metrics.connection_opened();

        debug!(
            target: "sfu.signaling",
            connection_id = %connection_id,
            "Signaling session opened"
        );

        SignalingSession {
            connection_id,
            registry: self.registry.clone(),
            metrics: Arc::clone(&self.metrics),
            notifier,
            state: SessionState::Unbound,
        }
    }
}

enum SessionState {
    Unbound,
    Bound(RoomActorHandle),
    Terminated,
}

/// Request handling for one connection.
pub struct SignalingSession {
    connection_id: String,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
    notifier: mpsc::Sender<ServerMessage>,
    state: SessionState,
}

impl SignalingSession {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Id of the room this connection joined, if any.
    #[must_use]
    pub fn bound_room(&self) -> Option<&str> {
        match &self.state {
            SessionState::Bound(room) => Some(room.room_id()),
            SessionState::Unbound | SessionState::Terminated => None,
        }
    }

    /// Handle one inbound text frame and produce its response.
    ///
    /// Malformed frames are answered, never fatal.
    #[instrument(skip_all, name = "sfu.signaling.request", fields(connection_id = %self.connection_id))]
    pub async fn handle_text(&mut self, text: &str) -> ServerMessage {
        let start = Instant::now();

        let (id, request) = match decode_frame(text) {
            Ok(decoded) => decoded,
            Err((id, error)) => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    request_id = id,
                    error = %error,
                    "Rejected malformed request"
                );
                metrics::record_request("invalid", error.error_code(), start.elapsed());
                return ServerMessage::failure(id, &error);
            }
        };

        let method = request.method();
        let result = self.handle_request(request).await;

        match result {
            Ok(data) => {
                metrics::record_request(method, "success", start.elapsed());
                ServerMessage::success(id, data)
            }
            Err(error) => {
                match &error {
                    SfuError::EngineFailure(_)
                    | SfuError::EngineTimeout { .. }
                    | SfuError::Internal(_) => {
                        warn!(
                            target: "sfu.signaling",
                            connection_id = %self.connection_id,
                            request_id = id,
                            method = method,
                            error = %error,
                            "Request failed"
                        );
                    }
                    _ => {
                        debug!(
                            target: "sfu.signaling",
                            connection_id = %self.connection_id,
                            request_id = id,
                            method = method,
                            error = %error,
                            "Request rejected"
                        );
                    }
                }
                metrics::record_request(method, error.error_code(), start.elapsed());
                ServerMessage::failure(id, &error)
            }
        }
    }

    /// Dispatch a decoded request; returns the response `data` payload.
    pub async fn handle_request(&mut self, request: Request) -> Result<Value, SfuError> {
        match request {
            Request::CreateRoom => {
                let room_id = self.registry.create_room().await?;
                to_data(CreateRoomResponse { room_id })
            }

            Request::JoinRoom(join) => {
                let router_rtp_capabilities = self.join_room(join.room_id).await?;
                to_data(JoinRoomResponse {
                    router_rtp_capabilities,
                })
            }

            Request::CreateSendTransport => {
                let params = self
                    .room()?
                    .create_transport(self.connection_id.clone(), TransportDirection::Send)
                    .await?;
                to_data(TransportCreatedResponse::from(params))
            }

            Request::CreateReceivingTransport => {
                let params = self
                    .room()?
                    .create_transport(self.connection_id.clone(), TransportDirection::Receive)
                    .await?;
                to_data(TransportCreatedResponse::from(params))
            }

            Request::ConnectTransport(connect) => {
                self.room()?
                    .connect_transport(
                        self.connection_id.clone(),
                        connect.transport_id,
                        connect.dtls_parameters,
                    )
                    .await?;
                Ok(json!({}))
            }

            Request::ProduceMedia(produce) => {
                let producer_id = self
                    .room()?
                    .produce(
                        self.connection_id.clone(),
                        produce.transport_id,
                        produce.kind,
                        produce.rtp_parameters,
                    )
                    .await?;
                to_data(ProduceMediaResponse { producer_id })
            }

            Request::ConsumeMedia(consume) => {
                let consumer = self
                    .room()?
                    .consume(
                        self.connection_id.clone(),
                        consume.transport_id,
                        consume.producer_id,
                        consume.rtp_capabilities,
                    )
                    .await?;
                to_data(ConsumeMediaResponse::from(consumer))
            }

            Request::CloseProducer(close) => {
                self.room()?
                    .close_producer(self.connection_id.clone(), close.producer_id)
                    .await?;
                Ok(json!({}))
            }
        }
    }

    /// Bind this connection to `room_id` and admit it as a peer.
    async fn join_room(&mut self, room_id: String) -> Result<Value, SfuError> {
        match &self.state {
            SessionState::Bound(room) if room.room_id() == room_id => {
                return room
                    .join(self.connection_id.clone(), self.notifier.clone())
                    .await;
            }
            SessionState::Bound(room) => {
                return Err(SfuError::AlreadyJoined(room.room_id().to_string()));
            }
            SessionState::Terminated => return Err(SfuError::NoBoundRoom),
            SessionState::Unbound => {}
        }

        let room = self.registry.get_room(&room_id).await?;
        let capabilities = room
            .join(self.connection_id.clone(), self.notifier.clone())
            .await?;
        self.state = SessionState::Bound(room);

        info!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            room_id = %room_id,
            "Connection joined room"
        );

        Ok(capabilities)
    }

    fn room(&self) -> Result<&RoomActorHandle, SfuError> {
        match &self.state {
            SessionState::Bound(room) => Ok(room),
            SessionState::Unbound | SessionState::Terminated => Err(SfuError::NoBoundRoom),
        }
    }

    /// Tear down the connection's peer, if any. Idempotent.
    ///
    /// Runs on every connection close, clean or not.
    pub async fn disconnect(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Terminated) {
            SessionState::Terminated => return,
            SessionState::Bound(room) => {
                if let Err(e) = room.peer_disconnected(self.connection_id.clone()).await {
                    warn!(
                        target: "sfu.signaling",
                        connection_id = %self.connection_id,
                        room_id = %room.room_id(),
                        error = %e,
                        "Peer cleanup failed"
                    );
                }
            }
            SessionState::Unbound => {}
        }

        self.metrics.connection_closed();

        debug!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            "Signaling session closed"
        );
    }
}

fn to_data<T: Serialize>(payload: T) -> Result<Value, SfuError> {
    serde_json::to_value(payload)
        .map_err(|e| SfuError::Internal(format!("response serialization failed: {e}")))
}
