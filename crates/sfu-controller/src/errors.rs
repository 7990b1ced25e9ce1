//! SFU Controller error types.
//!
//! Every variant maps to a stable wire `code` carried in signaling failure
//! responses. Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// SFU Controller error type.
///
/// Maps to signaling error codes:
/// - Lookups: `RoomNotFound`, `PeerNotFound`, `TransportNotFound`, `ProducerNotFound`
/// - Session state: `NoBoundRoom`, `AlreadyJoined`, `TransportAlreadyConnected`
/// - Negotiation: `IncompatibleCapabilities`, `InvalidRequest`
/// - Engine: `EngineFailure`, `EngineTimeout`
/// - Lifecycle: `Draining`, `InternalError`
#[derive(Debug, Error)]
pub enum SfuError {
    /// Room does not exist (never created, or already torn down).
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The connection has no peer record in its bound room.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// No transport with this id is reachable from the caller's room.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// No producer with this id exists in the caller's room.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// The consumer's RTP capabilities cannot receive the producer's media.
    #[error("Incompatible capabilities for producer {0}")]
    IncompatibleCapabilities(String),

    /// Room-scoped request issued before `joinRoom`.
    #[error("Connection is not bound to a room")]
    NoBoundRoom,

    /// Connection already joined a different room.
    #[error("Connection already joined room {0}")]
    AlreadyJoined(String),

    /// `connectTransport` was already accepted for this transport.
    #[error("Transport already connected: {0}")]
    TransportAlreadyConnected(String),

    /// Malformed or unknown request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The media engine rejected or failed a delegated call.
    #[error("Media engine failure: {0}")]
    EngineFailure(String),

    /// The media engine did not answer within the configured deadline.
    #[error("Media engine call timed out: {operation}")]
    EngineTimeout { operation: &'static str },

    /// Controller is shutting down.
    #[error("SFU controller is draining")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SfuError::RoomNotFound(_) => "RoomNotFound",
            SfuError::PeerNotFound(_) => "PeerNotFound",
            SfuError::TransportNotFound(_) => "TransportNotFound",
            SfuError::ProducerNotFound(_) => "ProducerNotFound",
            SfuError::IncompatibleCapabilities(_) => "IncompatibleCapabilities",
            SfuError::NoBoundRoom => "NoBoundRoom",
            SfuError::AlreadyJoined(_) => "AlreadyJoined",
            SfuError::TransportAlreadyConnected(_) => "TransportAlreadyConnected",
            SfuError::InvalidRequest(_) => "InvalidRequest",
            SfuError::EngineFailure(_) => "EngineFailure",
            SfuError::EngineTimeout { .. } => "EngineTimeout",
            SfuError::Draining => "Draining",
            SfuError::Internal(_) => "InternalError",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::PeerNotFound(_) => "Join the room before creating transports".to_string(),
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::IncompatibleCapabilities(_) => {
                "RTP capabilities cannot consume this producer".to_string()
            }
            SfuError::NoBoundRoom => "Join a room first".to_string(),
            SfuError::AlreadyJoined(_) => "Connection already joined another room".to_string(),
            SfuError::TransportAlreadyConnected(_) => "Transport is already connected".to_string(),
            // Decode errors only echo the client's own input
            SfuError::InvalidRequest(msg) => msg.clone(),
            SfuError::EngineFailure(_) => "Media server rejected the operation".to_string(),
            SfuError::EngineTimeout { .. } => "Media server did not respond in time".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        SfuError::EngineFailure(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SfuError::RoomNotFound("r1".to_string()).error_code(),
            "RoomNotFound"
        );
        assert_eq!(
            SfuError::TransportNotFound("t1".to_string()).error_code(),
            "TransportNotFound"
        );
        assert_eq!(
            SfuError::ProducerNotFound("p1".to_string()).error_code(),
            "ProducerNotFound"
        );
        assert_eq!(
            SfuError::IncompatibleCapabilities("p1".to_string()).error_code(),
            "IncompatibleCapabilities"
        );
        assert_eq!(SfuError::NoBoundRoom.error_code(), "NoBoundRoom");
        assert_eq!(
            SfuError::EngineFailure("boom".to_string()).error_code(),
            "EngineFailure"
        );
        assert_eq!(
            SfuError::EngineTimeout {
                operation: "create_router"
            }
            .error_code(),
            "EngineTimeout"
        );
        assert_eq!(
            SfuError::TransportAlreadyConnected("t1".to_string()).error_code(),
            "TransportAlreadyConnected"
        );
        assert_eq!(
            SfuError::Internal("oops".to_string()).error_code(),
            "InternalError"
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let engine_err = SfuError::EngineFailure("worker 3 died at /tmp/mediasoup".to_string());
        assert!(!engine_err.client_message().contains("/tmp"));
        assert_eq!(
            engine_err.client_message(),
            "Media server rejected the operation"
        );

        let internal = SfuError::Internal("channel send failed: closed".to_string());
        assert!(!internal.client_message().contains("channel"));

        let room = SfuError::RoomNotFound("secret-room-id".to_string());
        assert!(!room.client_message().contains("secret-room-id"));
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SfuError = EngineError::RouterNotFound("router-1".to_string()).into();

        assert!(matches!(err, SfuError::EngineFailure(_)));
        assert_eq!(err.error_code(), "EngineFailure");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SfuError::TransportNotFound("t-9".to_string())),
            "Transport not found: t-9"
        );
        assert_eq!(
            format!(
                "{}",
                SfuError::EngineTimeout {
                    operation: "consume"
                }
            ),
            "Media engine call timed out: consume"
        );
    }
}
