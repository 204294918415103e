/// Default upper bound on `totalChunks` for a single transfer.
pub const DEFAULT_MAX_TOTAL_CHUNKS: usize = 65_536;

/// Default upper bound on the size of one chunk payload: 4 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default upper bound on the bytes buffered for one transfer: 1 GiB.
pub const DEFAULT_MAX_TRANSFER_BYTES: usize = 1024 * 1024 * 1024;

/// Default number of transfers one connection may have in flight.
pub const DEFAULT_MAX_TRANSFERS_PER_CONNECTION: usize = 16;

/// Resource bounds applied to every transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub max_total_chunks: usize,
    pub max_chunk_size: usize,
    pub max_transfer_bytes: usize,
    pub max_transfers_per_connection: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            max_transfers_per_connection: DEFAULT_MAX_TRANSFERS_PER_CONNECTION,
        }
    }
}
