//! Value types exchanged with the media engine.
//!
//! RTP capabilities, RTP parameters and the ICE/DTLS blobs are carried as
//! opaque JSON. Only the engine interprets them; the controller stores and
//! forwards them verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as it appears on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportDirection {
    /// Client sends media to the SFU (producers live here).
    Send,
    /// Client receives media from the SFU (consumers live here).
    Receive,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Receive => "receive",
        }
    }
}

/// A single codec parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecParameter {
    Number(u32),
    Text(&'static str),
}

/// One entry of the router's statically declared codec set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCapability {
    pub kind: MediaKind,
    /// MIME type, e.g. `audio/opus` or `video/VP8`.
    pub mime_type: &'static str,
    pub clock_rate: u32,
    /// Channel count (audio only).
    pub channels: Option<u8>,
    pub parameters: Vec<(&'static str, CodecParameter)>,
}

/// Codec set every room router is created with: opus audio and VP8 video
/// with a starting bitrate hint.
#[must_use]
pub fn default_media_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus",
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Vec::new(),
        },
        CodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8",
            clock_rate: 90_000,
            channels: None,
            parameters: vec![("x-google-start-bitrate", CodecParameter::Number(1000))],
        },
    ]
}

/// A routing context created by the engine for one room.
#[derive(Debug, Clone)]
pub struct RouterDescriptor {
    pub id: String,
    /// Router RTP capabilities handed to every joining client.
    pub rtp_capabilities: Value,
}

/// Negotiation parameters of a freshly created WebRTC transport.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ProducerDescriptor {
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Closure notifications raised by the engine for a router's resources.
///
/// Delivered on the channel handed to [`super::MediaEngine::create_router`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ProducerClosed { producer_id: String },
    ConsumerClosed { consumer_id: String },
}

/// Errors reported by a media engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("router not found: {0}")]
    RouterNotFound(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("engine rejected request: {0}")]
    Rejected(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), "video");
        let kind: MediaKind = serde_json::from_value(serde_json::json!("audio")).unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_value::<MediaKind>(serde_json::json!("screen")).is_err());
    }

    #[test]
    fn test_default_codecs() {
        let codecs = default_media_codecs();
        assert_eq!(codecs.len(), 2);

        let opus = codecs.first().unwrap();
        assert_eq!(opus.mime_type, "audio/opus");
        assert_eq!(opus.clock_rate, 48_000);
        assert_eq!(opus.channels, Some(2));

        let vp8 = codecs.get(1).unwrap();
        assert_eq!(vp8.kind, MediaKind::Video);
        assert_eq!(vp8.clock_rate, 90_000);
        assert_eq!(
            vp8.parameters,
            vec![("x-google-start-bitrate", CodecParameter::Number(1000))]
        );
    }
}
