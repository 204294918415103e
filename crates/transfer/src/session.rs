use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kuro_protocol::Progress;

use crate::presence::PresenceSet;
use crate::sanitize::sanitize_filename;
use crate::{TransferError, TransferLimits};

/// A session shared between its connection and its progress reporter.
pub type SharedSession = Arc<Mutex<TransferSession>>;

/// Locks a shared session, recovering the guard if a holder panicked.
pub fn lock_session(session: &SharedSession) -> MutexGuard<'_, TransferSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a successfully accepted chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// The chunk was stored; the transfer is still incomplete.
    Stored { received: usize, total: usize },
    /// The chunk completed the transfer. The session is now finished.
    Complete(CompletedTransfer),
}

/// A fully reassembled transfer, ready for the persistence sink.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub transfer_id: String,
    /// Sanitized filename.
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Reassembly state for one in-flight transfer.
#[derive(Debug)]
pub struct TransferSession {
    transfer_id: String,
    filename: String,
    total_chunks: usize,
    received: PresenceSet,
    /// Payloads keyed by chunk index; only received chunks take space.
    buffer: BTreeMap<usize, Vec<u8>>,
    buffered_bytes: usize,
    limits: TransferLimits,
    last_activity: Instant,
    finished: bool,
}

impl TransferSession {
    /// Creates a session, validating `total_chunks` against `limits`.
    ///
    /// The filename is stored in sanitized form.
    pub fn new(
        transfer_id: impl Into<String>,
        filename: &str,
        total_chunks: i64,
        limits: TransferLimits,
    ) -> Result<Self, TransferError> {
        if total_chunks <= 0 {
            return Err(TransferError::InvalidTotalChunks(total_chunks));
        }
        let total = usize::try_from(total_chunks)
            .ok()
            .filter(|&t| t <= limits.max_total_chunks)
            .ok_or(TransferError::TooManyChunks {
                total: total_chunks,
                max: limits.max_total_chunks,
            })?;

        Ok(Self {
            transfer_id: transfer_id.into(),
            filename: sanitize_filename(filename),
            total_chunks: total,
            received: PresenceSet::new(total),
            buffer: BTreeMap::new(),
            buffered_bytes: 0,
            limits,
            last_activity: Instant::now(),
            finished: false,
        })
    }

    /// Stores one chunk.
    ///
    /// A rejected chunk leaves the session untouched. Storing an index
    /// twice overwrites the earlier payload. When the last missing index
    /// arrives the buffer is concatenated in index order, the session is
    /// marked finished, and the bytes are handed back to the caller.
    pub fn accept_chunk(
        &mut self,
        index: i64,
        total_chunks: i64,
        bytes: Vec<u8>,
    ) -> Result<ChunkOutcome, TransferError> {
        if self.finished {
            return Err(TransferError::SessionFinished(self.transfer_id.clone()));
        }
        if usize::try_from(total_chunks).ok() != Some(self.total_chunks) {
            return Err(TransferError::TotalChunksMismatch {
                expected: self.total_chunks,
                got: total_chunks,
            });
        }
        let slot = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.total_chunks)
            .ok_or(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            })?;
        if bytes.len() > self.limits.max_chunk_size {
            return Err(TransferError::ChunkTooLarge {
                size: bytes.len(),
                max: self.limits.max_chunk_size,
            });
        }

        let replaced = self.buffer.get(&slot).map_or(0, Vec::len);
        let buffered = self.buffered_bytes - replaced + bytes.len();
        if buffered > self.limits.max_transfer_bytes {
            return Err(TransferError::TransferTooLarge {
                size: buffered,
                max: self.limits.max_transfer_bytes,
            });
        }

        self.buffer.insert(slot, bytes);
        self.buffered_bytes = buffered;
        self.received.insert(slot);
        self.last_activity = Instant::now();

        if !self.received.is_complete() {
            return Ok(ChunkOutcome::Stored {
                received: self.received.len(),
                total: self.total_chunks,
            });
        }

        let mut assembled = Vec::with_capacity(self.buffered_bytes);
        for part in std::mem::take(&mut self.buffer).into_values() {
            assembled.extend_from_slice(&part);
        }
        self.buffered_bytes = 0;
        self.finished = true;

        Ok(ChunkOutcome::Complete(CompletedTransfer {
            transfer_id: self.transfer_id.clone(),
            filename: self.filename.clone(),
            bytes: assembled,
        }))
    }

    /// Marks the session finished and drops any partial buffer.
    pub fn discard(&mut self) {
        self.finished = true;
        self.buffer.clear();
        self.buffered_bytes = 0;
    }

    /// Current progress, counted over distinct stored indices.
    pub fn progress(&self) -> Progress {
        Progress {
            transfer_id: self.transfer_id.clone(),
            received_count: self.received.len() as u64,
            total_chunks: self.total_chunks as u64,
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Sanitized filename.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time since the last accepted chunk, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
