//! Text frame codec: JSON in, [`Frame`] out, with typed failures.
//!
//! Decoding goes through an untyped [`serde_json::Value`] first so the
//! decoder can tell an unknown `type` apart from a known type with bad
//! fields, and so it can recover the `transferId` of a malformed frame for
//! the error reply.

use serde_json::Value;

use crate::constants::FrameType;
use crate::frame::Frame;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no \"type\" field")]
    MissingType,

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("invalid {frame_type} frame: {reason}")]
    InvalidFields {
        frame_type: FrameType,
        transfer_id: Option<String>,
        reason: String,
    },

    #[error("binary frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("binary frame header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },
}

impl DecodeError {
    /// Returns the transfer the malformed frame referred to, if it was
    /// recoverable.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::InvalidFields { transfer_id, .. } => transfer_id.as_deref(),
            _ => None,
        }
    }

    /// Builds the `error` frame sent back to the originator.
    pub fn to_frame(&self) -> Frame {
        Frame::error(self.transfer_id().map(str::to_owned), self.to_string())
    }
}

/// Decodes a text frame.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    decode_slice(text.as_bytes())
}

/// Decodes a frame from raw JSON bytes.
pub fn decode_slice(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    decode_value(value)
}

/// Decodes a frame from an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Frame, DecodeError> {
    let (frame_type, transfer_id) = peek(&value)?;
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidFields {
        frame_type,
        transfer_id,
        reason: e.to_string(),
    })
}

/// Encodes a frame as JSON text.
pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Reads the discriminator and the (non-empty) `transferId` of a frame.
pub(crate) fn peek(value: &Value) -> Result<(FrameType, Option<String>), DecodeError> {
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let frame_type = match obj.get("type") {
        None | Some(Value::Null) => return Err(DecodeError::MissingType),
        Some(Value::String(raw)) => {
            let ft: FrameType = serde_json::from_value(Value::String(raw.clone()))
                .unwrap_or(FrameType::Unknown);
            if ft == FrameType::Unknown {
                return Err(DecodeError::UnknownType(raw.clone()));
            }
            ft
        }
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
    };

    let transfer_id = obj
        .get("transferId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    Ok((frame_type, transfer_id))
}
