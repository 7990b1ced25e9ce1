//! Pre-configured negotiation payloads.
//!
//! The in-memory engine only looks at `codecs[].mimeType`, but the payloads
//! are shaped like real browser output so they also document the wire format.

use serde_json::{json, Value};

/// Send-side RTP parameters of a VP8 video track.
#[must_use]
pub fn vp8_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 96,
            "clockRate": 90000,
            "parameters": {},
            "rtcpFeedback": [{ "type": "nack" }, { "type": "nack", "parameter": "pli" }]
        }],
        "headerExtensions": [],
        "encodings": [{ "ssrc": 11_111_111 }],
        "rtcp": { "cname": "test-video", "reducedSize": true }
    })
}

/// Send-side RTP parameters of an opus audio track.
#[must_use]
pub fn opus_rtp_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2,
            "parameters": { "useinbandfec": 1 },
            "rtcpFeedback": []
        }],
        "headerExtensions": [],
        "encodings": [{ "ssrc": 22_222_222 }],
        "rtcp": { "cname": "test-audio", "reducedSize": true }
    })
}

/// Receiver capabilities matching the default router codecs (opus + VP8).
#[must_use]
pub fn default_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": {},
                "rtcpFeedback": []
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": {},
                "rtcpFeedback": [{ "type": "nack" }]
            }
        ],
        "headerExtensions": []
    })
}

/// Receiver capabilities that only decode H264, so they cannot receive VP8.
#[must_use]
pub fn h264_only_rtp_capabilities() -> Value {
    json!({
        "codecs": [{
            "kind": "video",
            "mimeType": "video/H264",
            "preferredPayloadType": 102,
            "clockRate": 90000,
            "parameters": { "packetization-mode": 1, "profile-level-id": "42e01f" },
            "rtcpFeedback": []
        }],
        "headerExtensions": []
    })
}

/// Client DTLS parameters for `connectTransport`.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "E5:F5:CA:A7:2D:93:E6:16:AC:21:09:9F:23:51:62:8C:D0:66:E9:0C:22:54:2B:82:0C:DF:E0:C5:2C:7E:CD:53"
        }]
    })
}
