//! WebSocket binding of the signaling gateway.
//!
//! `GET /ws` upgrades to a WebSocket carrying JSON text frames. Each
//! connection gets:
//! - a [`super::gateway::SignalingSession`] that handles its requests in arrival order
//! - a bounded outbound queue drained by a writer task, shared by responses
//!   and room notifications
//!
//! Upgrades beyond the configured connection limit get `503`.

use super::gateway::SignalingGateway;
use super::protocol::{ServerMessage, UNCORRELATED_ID};
use crate::errors::SfuError;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Limits applied to WebSocket connections.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

/// Router state for the signaling endpoint.
#[derive(Clone)]
pub struct SignalingServer {
    gateway: SignalingGateway,
    connection_semaphore: Arc<Semaphore>,
    limits: ConnectionLimits,
}

impl SignalingServer {
    #[must_use]
    pub fn new(gateway: SignalingGateway, limits: ConnectionLimits) -> Self {
        Self {
            gateway,
            connection_semaphore: Arc::new(Semaphore::new(limits.max_connections)),
            limits,
        }
    }

    /// Router exposing `GET /ws`.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self)
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let Ok(permit) = Arc::clone(&server.connection_semaphore).try_acquire_owned() else {
        warn!(
            target: "sfu.signaling",
            max_connections = server.limits.max_connections,
            "Connection limit reached, rejecting WebSocket upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    let outbound_buffer = server.limits.outbound_buffer;
    ws.max_message_size(server.limits.max_message_size)
        .on_failed_upgrade(|error| {
            warn!(target: "sfu.signaling", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| {
            handle_connection(socket, server.gateway, outbound_buffer, permit)
        })
}

/// Drive one WebSocket connection until it closes.
async fn handle_connection(
    socket: WebSocket,
    gateway: SignalingGateway,
    outbound_buffer: usize,
    _permit: OwnedSemaphorePermit,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(outbound_buffer.max(1));
    let mut session = gateway.open_session(outbound_tx.clone());
    let connection_id = session.connection_id().to_string();

    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        "WebSocket connection opened"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let writer_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(
                        target: "sfu.signaling",
                        connection_id = %writer_connection_id,
                        error = %e,
                        "Failed to serialize outbound frame"
                    );
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(
            target: "sfu.signaling",
            connection_id = %writer_connection_id,
            "Writer task finished"
        );
    });

    while let Some(frame) = ws_receiver.next().await {
        let reply = match frame {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Binary(_)) => ServerMessage::failure(
                UNCORRELATED_ID,
                &SfuError::InvalidRequest("binary frames are not supported".to_string()),
            ),
            // Pings are answered by the WebSocket layer
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
        };

        // Responses wait for queue space; notifications never do
        if outbound_tx.send(reply).await.is_err() {
            break;
        }
    }

    session.disconnect().await;
    drop(outbound_tx);
    drop(session);

    // Let queued responses flush, but never outlive a dead socket
    if tokio::time::timeout(std::time::Duration::from_secs(1), send_task)
        .await
        .is_err()
    {
        debug!(
            target: "sfu.signaling",
            connection_id = %connection_id,
            "Writer task did not finish in time"
        );
    }

    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        "WebSocket connection closed"
    );
}
