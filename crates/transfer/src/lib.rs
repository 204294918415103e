//! Reassembly of chunked uploads: per-transfer sessions, periodic progress
//! reporting and persistence of completed files.

mod limits;
mod presence;
mod progress;
mod sanitize;
mod session;
mod sink;

pub use limits::{
    DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_MAX_TRANSFER_BYTES,
    DEFAULT_MAX_TRANSFERS_PER_CONNECTION, TransferLimits,
};
pub use presence::PresenceSet;
pub use progress::{ProgressCallback, ProgressReporter};
pub use sanitize::{MAX_FILENAME_BYTES, sanitize_filename};
pub use session::{
    ChunkOutcome, CompletedTransfer, SharedSession, TransferSession, lock_session,
};
pub use sink::{CollisionPolicy, DirectorySink, Sink, StoreFuture, checksum_bytes};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("totalChunks must be positive, got {0}")]
    InvalidTotalChunks(i64),

    #[error("totalChunks {total} exceeds the limit of {max}")]
    TooManyChunks { total: i64, max: usize },

    #[error("totalChunks mismatch: transfer has {expected}, chunk says {got}")]
    TotalChunksMismatch { expected: usize, got: i64 },

    #[error("chunkIndex {index} out of range for {total} chunks")]
    IndexOutOfRange { index: i64, total: usize },

    #[error("chunk of {size} bytes exceeds the limit of {max}")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("transfer would buffer {size} bytes, over the limit of {max}")]
    TransferTooLarge { size: usize, max: usize },

    #[error("too many concurrent transfers on this connection (limit {max})")]
    TooManyTransfers { max: usize },

    #[error("transfer already finished: {0}")]
    SessionFinished(String),

    #[error("file already exists: {0}")]
    FileExists(String),
}
