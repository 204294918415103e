//! WebSocket server for chunked file uploads.
//!
//! Accepts any number of uploader connections (up to a configured limit).
//! Each connection owns its in-flight transfers; JSON and binary
//! `file_chunk` frames are routed to them, progress is reported
//! periodically, and completed files are handed to a [`kuro_transfer::Sink`].
//! Every disconnect path discards the connection's partial transfers.

mod connection;
mod server;
mod state;

pub use connection::{SendError, Sender};
pub use server::{ServerConfig, UploadServer};
pub use state::{ConnectionState, TransferSettings};

/// Send buffer capacity per connection.
///
/// Progress frames for every active transfer share this buffer with replies;
/// `try_send()` drops frames once it is full.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server already running")]
    AlreadyRunning,

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),
}
