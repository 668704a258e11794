//! Codec for encoding/decoding tunnel envelopes

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeKind, Message};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame is not an envelope at all, or names an unknown kind
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Envelope kind is known but its payload has the wrong shape
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: EnvelopeKind, reason: String },

    /// Outbound envelope encodes above the frame limit
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodecError {
    /// Errors that only invalidate the offending frame
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            CodecError::Protocol(_)
                | CodecError::MalformedPayload { .. }
                | CodecError::FrameTooLarge(_)
        )
    }
}

#[derive(Serialize)]
struct OutboundFrame<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    id: &'a str,
    payload: &'a P,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct EmptyPayload {}

/// Envelope codec
///
/// Format: one JSON object per frame, `{"type": ..., "id": ..., "payload": {...}}`
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = crate::MAX_FRAME_SIZE;

    /// Encode an envelope to a text frame
    pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
        let id = envelope.id.as_str();
        let frame = match &envelope.message {
            Message::Request(request) => Self::frame(EnvelopeKind::Request, id, request)?,
            Message::Response(response) => Self::frame(EnvelopeKind::Response, id, response)?,
            Message::Heartbeat => Self::frame(EnvelopeKind::Heartbeat, id, &EmptyPayload {})?,
            Message::HeartbeatAck => {
                Self::frame(EnvelopeKind::HeartbeatAck, id, &EmptyPayload {})?
            }
            Message::WsStart(target) => Self::frame(EnvelopeKind::WsStart, id, target)?,
            Message::WsData(data) => Self::frame(EnvelopeKind::WsData, id, data)?,
            Message::WsClose(close) => Self::frame(EnvelopeKind::WsClose, id, close)?,
        };

        if frame.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame.len()));
        }

        Ok(frame)
    }

    /// Decode a text frame into an envelope
    ///
    /// Pure: a rejected frame leaves no state behind, so the next frame on the
    /// same connection decodes independently.
    pub fn decode(frame: &str) -> Result<Envelope, CodecError> {
        if frame.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                Self::MAX_FRAME_SIZE
            )));
        }

        let inbound: InboundFrame = serde_json::from_str(frame)
            .map_err(|e| CodecError::Protocol(format!("invalid envelope: {}", e)))?;

        let kind = EnvelopeKind::parse(&inbound.kind)
            .ok_or_else(|| CodecError::Protocol(format!("unknown type '{}'", inbound.kind)))?;

        if inbound.id.is_empty() {
            return Err(CodecError::Protocol(format!("{} envelope without id", kind)));
        }

        let payload = inbound.payload;
        let message = match kind {
            EnvelopeKind::Request => Message::Request(Self::payload(kind, payload)?),
            EnvelopeKind::Response => Message::Response(Self::payload(kind, payload)?),
            // Heartbeat payloads carry nothing we trust; timestamps are taken at receipt
            EnvelopeKind::Heartbeat => Message::Heartbeat,
            EnvelopeKind::HeartbeatAck => Message::HeartbeatAck,
            EnvelopeKind::WsStart => Message::WsStart(Self::payload(kind, payload)?),
            EnvelopeKind::WsData => Message::WsData(Self::payload(kind, payload)?),
            EnvelopeKind::WsClose => {
                if payload.is_null() {
                    Message::WsClose(Default::default())
                } else {
                    Message::WsClose(Self::payload(kind, payload)?)
                }
            }
        };

        Ok(Envelope {
            id: inbound.id,
            message,
        })
    }

    fn frame<P: Serialize>(kind: EnvelopeKind, id: &str, payload: &P) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&OutboundFrame { kind, id, payload })?)
    }

    fn payload<T: serde::de::DeserializeOwned>(
        kind: EnvelopeKind,
        payload: serde_json::Value,
    ) -> Result<T, CodecError> {
        serde_json::from_value(payload).map_err(|e| CodecError::MalformedPayload {
            kind,
            reason: e.to_string(),
        })
    }
}
