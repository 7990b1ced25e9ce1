//! Signaling wire format.
//!
//! Clients send JSON text frames of the form
//! `{"id": 7, "method": "joinRoom", "data": {"roomId": "..."}}` and receive
//! either a response correlated by `id` or an unsolicited notification:
//!
//! ```json
//! {"type": "response", "id": 7, "success": true, "data": {"routerRtpCapabilities": {}}}
//! {"type": "response", "id": 7, "success": false, "error": {"code": "RoomNotFound", "message": "Room not found"}}
//! {"type": "notification", "method": "newProducer", "data": {"producerId": "...", "peerId": "..."}}
//! ```

use crate::engine::{ConsumerDescriptor, MediaKind, TransportParameters};
use crate::errors::SfuError;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id used when a frame has no readable `id`.
pub const UNCORRELATED_ID: u64 = 0;

/// Request envelope as it arrives on the wire.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    id: u64,
    method: String,
    #[serde(default)]
    data: Value,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateRoom,
    JoinRoom(JoinRoomRequest),
    CreateSendTransport,
    CreateReceivingTransport,
    ConnectTransport(ConnectTransportRequest),
    ProduceMedia(ProduceMediaRequest),
    ConsumeMedia(ConsumeMediaRequest),
    CloseProducer(CloseProducerRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceMediaRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeMediaRequest {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest {
    pub producer_id: String,
}

impl Request {
    /// Decode the `data` payload of `method`.
    pub fn decode(method: &str, data: Value) -> Result<Self, SfuError> {
        let request = match method {
            "createRoom" => Request::CreateRoom,
            "joinRoom" => Request::JoinRoom(payload(method, data)?),
            "createSendTransport" => Request::CreateSendTransport,
            "createReceivingTransport" => Request::CreateReceivingTransport,
            "connectTransport" => Request::ConnectTransport(payload(method, data)?),
            "produceMedia" => Request::ProduceMedia(payload(method, data)?),
            "consumeMedia" => Request::ConsumeMedia(payload(method, data)?),
            "closeProducer" => Request::CloseProducer(payload(method, data)?),
            other => {
                return Err(SfuError::InvalidRequest(format!("unknown method: {other}")));
            }
        };
        Ok(request)
    }

    /// Wire name of the method, also used as the metrics label.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Request::CreateRoom => "createRoom",
            Request::JoinRoom(_) => "joinRoom",
            Request::CreateSendTransport => "createSendTransport",
            Request::CreateReceivingTransport => "createReceivingTransport",
            Request::ConnectTransport(_) => "connectTransport",
            Request::ProduceMedia(_) => "produceMedia",
            Request::ConsumeMedia(_) => "consumeMedia",
            Request::CloseProducer(_) => "closeProducer",
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(method: &str, data: Value) -> Result<T, SfuError> {
    serde_json::from_value(data)
        .map_err(|e| SfuError::InvalidRequest(format!("invalid data for {method}: {e}")))
}

/// Decode one text frame.
///
/// On failure the error carries the request id when one could be read, else
/// [`UNCORRELATED_ID`].
pub fn decode_frame(text: &str) -> Result<(u64, Request), (u64, SfuError)> {
    let envelope: RequestEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64))
                .unwrap_or(UNCORRELATED_ID);
            return Err((
                id,
                SfuError::InvalidRequest(format!("malformed request: {e}")),
            ));
        }
    };

    Request::decode(&envelope.method, envelope.data)
        .map(|request| (envelope.id, request))
        .map_err(|e| (envelope.id, e))
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}

impl ServerMessage {
    #[must_use]
    pub fn success(id: u64, data: Value) -> Self {
        ServerMessage::Response(Response {
            id,
            success: true,
            data: Some(data),
            error: None,
        })
    }

    /// Failure response carrying only the client-safe message.
    #[must_use]
    pub fn failure(id: u64, error: &SfuError) -> Self {
        ServerMessage::Response(Response {
            id,
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: error.error_code().to_string(),
                message: error.client_message(),
            }),
        })
    }

    #[must_use]
    pub fn new_producer(producer_id: &str, peer_id: &str) -> Self {
        ServerMessage::Notification(Notification::NewProducer(NewProducer {
            producer_id: producer_id.to_string(),
            peer_id: peer_id.to_string(),
        }))
    }

    /// JSON text of the frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Notification {
    NewProducer(NewProducer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: String,
    pub peer_id: String,
}

// ============================================================================
// Response payloads
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub router_rtp_capabilities: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedResponse {
    pub transport_id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

impl From<TransportParameters> for TransportCreatedResponse {
    fn from(params: TransportParameters) -> Self {
        Self {
            transport_id: params.id,
            ice_parameters: params.ice_parameters,
            ice_candidates: params.ice_candidates,
            dtls_parameters: params.dtls_parameters,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceMediaResponse {
    pub producer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeMediaResponse {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

impl From<ConsumerDescriptor> for ConsumeMediaResponse {
    fn from(consumer: ConsumerDescriptor) -> Self {
        Self {
            consumer_id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
        }
    }
}
