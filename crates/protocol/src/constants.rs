use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead and its transfers are discarded. Browsers
/// answer pings automatically, so an idle but healthy uploader never trips it.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings the client.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum WebSocket message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Default interval between `progress` frames for an active transfer.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Frame type discriminator carried in the `"type"` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    // Client to server
    #[serde(rename = "file_chunk")]
    FileChunk,

    // Server to client
    #[serde(rename = "progress")]
    Progress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Error,

    /// Anything else deserializes here so the decoder can report it.
    #[serde(other)]
    Unknown,
}

impl FrameType {
    /// Wire name of the frame type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileChunk => "file_chunk",
            Self::Progress => "progress",
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
