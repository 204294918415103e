//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.
//!
//! Carries the same fields as a JSON `file_chunk` without base64 inflation.

use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, peek};
use crate::constants::FrameType;
use crate::frame::{FileChunk, Frame};

/// JSON header of a binary chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryChunkHeader {
    #[serde(rename = "type", default = "file_chunk_type")]
    pub frame_type: FrameType,
    pub transfer_id: String,
    pub filename: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
}

fn file_chunk_type() -> FrameType {
    FrameType::FileChunk
}

/// Decodes a raw binary WebSocket message into a `file_chunk` [`Frame`].
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn decode_binary(data: &[u8]) -> Result<Frame, DecodeError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(DecodeError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(DecodeError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }
    let (header_bytes, payload) = rest.split_at(header_len);

    let mut value: serde_json::Value = serde_json::from_slice(header_bytes)
        .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    // A header without a type is a chunk header.
    if let Some(obj) = value.as_object_mut() {
        obj.entry("type")
            .or_insert_with(|| serde_json::Value::String(FrameType::FileChunk.to_string()));
    }
    let (frame_type, transfer_id) = peek(&value)?;

    if frame_type != FrameType::FileChunk {
        return Err(DecodeError::InvalidFields {
            frame_type,
            transfer_id,
            reason: "only file_chunk frames may be sent as binary".into(),
        });
    }

    let header: BinaryChunkHeader =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidFields {
            frame_type,
            transfer_id,
            reason: e.to_string(),
        })?;

    Ok(Frame::FileChunk(FileChunk {
        transfer_id: header.transfer_id,
        filename: header.filename,
        chunk_index: header.chunk_index,
        total_chunks: header.total_chunks,
        chunk: payload.to_vec(),
    }))
}

/// Encodes a chunk as a binary WebSocket message.
pub fn encode_binary(chunk: &FileChunk) -> Result<Vec<u8>, serde_json::Error> {
    let header = BinaryChunkHeader {
        frame_type: FrameType::FileChunk,
        transfer_id: chunk.transfer_id.clone(),
        filename: chunk.filename.clone(),
        chunk_index: chunk.chunk_index,
        total_chunks: chunk.total_chunks,
    };
    let header_json = serde_json::to_vec(&header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + chunk.chunk.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(&chunk.chunk);
    Ok(buf)
}
