use serde::{Deserialize, Serialize};

use crate::constants::FrameType;

// ---------------------------------------------------------------------------
// Client to server
// ---------------------------------------------------------------------------

/// One chunk of a file upload.
///
/// `chunk_index` and `total_chunks` are signed so that out-of-range values
/// survive decoding and can be rejected as validation errors naming the
/// transfer, rather than as anonymous protocol errors.
///
/// The `chunk` field is base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub transfer_id: String,
    pub filename: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    #[serde(with = "base64_bytes")]
    pub chunk: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Server to client
// ---------------------------------------------------------------------------

/// Periodic progress report for an active transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub transfer_id: String,
    pub received_count: u64,
    pub total_chunks: u64,
}

/// Sent once a transfer has been reassembled and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Success {
    pub transfer_id: String,
    pub stored_filename: String,
}

/// Human-readable failure report.
///
/// `transfer_id` is omitted when the offending frame could not be tied to a
/// transfer (e.g. unparseable JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single protocol message, discriminated by its `"type"` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "file_chunk")]
    FileChunk(FileChunk),
    #[serde(rename = "progress")]
    Progress(Progress),
    #[serde(rename = "success")]
    Success(Success),
    #[serde(rename = "error")]
    Error(ErrorReport),
}

impl Frame {
    /// Builds a `progress` frame.
    pub fn progress(transfer_id: impl Into<String>, received_count: u64, total_chunks: u64) -> Self {
        Self::Progress(Progress {
            transfer_id: transfer_id.into(),
            received_count,
            total_chunks,
        })
    }

    /// Builds a `success` frame.
    pub fn success(transfer_id: impl Into<String>, stored_filename: impl Into<String>) -> Self {
        Self::Success(Success {
            transfer_id: transfer_id.into(),
            stored_filename: stored_filename.into(),
        })
    }

    /// Builds an `error` frame, optionally tied to a transfer.
    pub fn error(transfer_id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorReport {
            transfer_id,
            message: message.into(),
        })
    }

    /// Builds an `error` frame for a known transfer.
    pub fn transfer_error(transfer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::error(Some(transfer_id.into()), message)
    }

    /// Returns the type discriminator of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::FileChunk(_) => FrameType::FileChunk,
            Self::Progress(_) => FrameType::Progress,
            Self::Success(_) => FrameType::Success,
            Self::Error(_) => FrameType::Error,
        }
    }

    /// Returns the transfer this frame refers to, if any.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::FileChunk(c) => Some(&c.transfer_id),
            Self::Progress(p) => Some(&p.transfer_id),
            Self::Success(s) => Some(&s.transfer_id),
            Self::Error(e) => e.transfer_id.as_deref(),
        }
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
