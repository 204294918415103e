//! Per-connection transfer bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kuro_protocol::constants::DEFAULT_PROGRESS_INTERVAL;
use kuro_protocol::{FileChunk, Frame, Progress, decode, decode_binary};
use kuro_transfer::{
    ChunkOutcome, CompletedTransfer, ProgressReporter, SharedSession, Sink, TransferError,
    TransferLimits, TransferSession, lock_session,
};
use tracing::{debug, info, warn};

use crate::connection::Sender;

/// Default idle time after which an incomplete transfer is dropped.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest pause between two stall sweeps.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Transfer behaviour shared by every connection of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub progress_interval: Duration,
    /// `None` disables stall expiry.
    pub stall_timeout: Option<Duration>,
    pub limits: TransferLimits,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stall_timeout: Some(DEFAULT_STALL_TIMEOUT),
            limits: TransferLimits::default(),
        }
    }
}

impl TransferSettings {
    /// How often stalled transfers are looked for, if at all.
    pub fn sweep_period(&self) -> Option<Duration> {
        self.stall_timeout
            .map(|timeout| (timeout / 2).clamp(Duration::from_millis(1), MAX_SWEEP_PERIOD))
    }
}

struct ActiveTransfer {
    session: SharedSession,
    reporter: ProgressReporter,
}

impl ActiveTransfer {
    /// Stops the reporter, then drops the partial buffer.
    fn discard(self) {
        self.reporter.cancel();
        lock_session(&self.session).discard();
    }
}

/// Transfers owned by one connection.
///
/// Frames are handled one at a time by the connection's read pump. Dropping
/// the state runs [`close`](Self::close).
pub struct ConnectionState<S: Sink> {
    conn_id: String,
    sender: Sender,
    sink: Arc<S>,
    settings: TransferSettings,
    transfers: HashMap<String, ActiveTransfer>,
    closed: bool,
}

impl<S: Sink> ConnectionState<S> {
    pub fn new(
        conn_id: impl Into<String>,
        sender: Sender,
        sink: Arc<S>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
            sink,
            settings,
            transfers: HashMap::new(),
            closed: false,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Number of transfers currently in flight.
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn has_transfer(&self, transfer_id: &str) -> bool {
        self.transfers.contains_key(transfer_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Decodes a text frame and handles it. Decode failures are replied
    /// to as `error` frames.
    pub async fn handle_text(&mut self, text: &str) {
        match decode(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                warn!(conn_id = %self.conn_id, "rejecting text frame: {e}");
                self.reply(e.to_frame());
            }
        }
    }

    /// Decodes a binary chunk frame and handles it.
    pub async fn handle_binary(&mut self, data: &[u8]) {
        match decode_binary(data) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                warn!(conn_id = %self.conn_id, "rejecting binary frame: {e}");
                self.reply(e.to_frame());
            }
        }
    }

    /// Routes a decoded frame.
    pub async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::FileChunk(chunk) => self.handle_chunk(chunk).await,
            other => {
                let frame_type = other.frame_type();
                warn!(conn_id = %self.conn_id, %frame_type, "client sent a server-only frame");
                self.reply(Frame::error(
                    other.transfer_id().map(str::to_owned),
                    format!("{frame_type} frames cannot be sent by clients"),
                ));
            }
        }
    }

    async fn handle_chunk(&mut self, chunk: FileChunk) {
        if self.closed {
            return;
        }
        if chunk.transfer_id.is_empty() {
            self.reply(Frame::error(None, "file_chunk requires a non-empty transferId"));
            return;
        }

        let transfer_id = chunk.transfer_id.clone();
        let index = chunk.chunk_index;

        let result = if let Some(active) = self.transfers.get(&transfer_id) {
            let mut session = lock_session(&active.session);
            if chunk.filename != session.filename() {
                debug!(
                    conn_id = %self.conn_id,
                    %transfer_id,
                    filename = %chunk.filename,
                    "ignoring filename change mid-transfer"
                );
            }
            session.accept_chunk(chunk.chunk_index, chunk.total_chunks, chunk.chunk)
        } else {
            self.open_transfer(chunk)
        };

        match result {
            Ok(ChunkOutcome::Stored { received, total }) => {
                debug!(conn_id = %self.conn_id, %transfer_id, index, received, total, "chunk stored");
            }
            Ok(ChunkOutcome::Complete(done)) => self.complete(done).await,
            Err(e) => {
                warn!(conn_id = %self.conn_id, %transfer_id, index, "chunk rejected: {e}");
                self.reply(Frame::transfer_error(transfer_id, e.to_string()));
            }
        }
    }

    /// Creates a session for the first chunk of a transfer.
    ///
    /// Nothing is registered unless the chunk is accepted.
    fn open_transfer(&mut self, chunk: FileChunk) -> Result<ChunkOutcome, TransferError> {
        let limits = self.settings.limits;
        if self.transfers.len() >= limits.max_transfers_per_connection {
            return Err(TransferError::TooManyTransfers {
                max: limits.max_transfers_per_connection,
            });
        }

        let mut session =
            TransferSession::new(&chunk.transfer_id, &chunk.filename, chunk.total_chunks, limits)?;
        let outcome = session.accept_chunk(chunk.chunk_index, chunk.total_chunks, chunk.chunk)?;

        if let ChunkOutcome::Stored { .. } = outcome {
            info!(
                conn_id = %self.conn_id,
                transfer_id = %chunk.transfer_id,
                filename = %session.filename(),
                total_chunks = session.total_chunks(),
                "transfer started"
            );
            let session: SharedSession = Arc::new(Mutex::new(session));
            let sender = self.sender.clone();
            let reporter = ProgressReporter::spawn(
                Arc::clone(&session),
                self.settings.progress_interval,
                Box::new(move |progress: Progress| {
                    let _ = sender.send_frame(&Frame::Progress(progress));
                }),
            );
            self.transfers
                .insert(chunk.transfer_id, ActiveTransfer { session, reporter });
        }

        Ok(outcome)
    }

    /// Persists a reassembled transfer and reports the outcome.
    async fn complete(&mut self, done: CompletedTransfer) {
        if let Some(active) = self.transfers.remove(&done.transfer_id) {
            active.reporter.cancel();
        }

        let CompletedTransfer {
            transfer_id,
            filename,
            bytes,
        } = done;
        let size = bytes.len();

        match self.sink.store(filename, bytes).await {
            Ok(stored) => {
                info!(conn_id = %self.conn_id, %transfer_id, filename = %stored, size, "transfer complete");
                self.reply(Frame::success(transfer_id, stored));
            }
            Err(e) => {
                warn!(conn_id = %self.conn_id, %transfer_id, "failed to store transfer: {e}");
                self.reply(Frame::transfer_error(
                    transfer_id,
                    format!("failed to store file: {e}"),
                ));
            }
        }
    }

    /// Drops every transfer that has been idle for at least the stall
    /// timeout, telling the client about each one. Returns how many expired.
    pub fn expire_stalled(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.settings.stall_timeout else {
            return 0;
        };

        let stalled: Vec<String> = self
            .transfers
            .iter()
            .filter(|(_, active)| lock_session(&active.session).idle_for(now) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for transfer_id in &stalled {
            if let Some(active) = self.transfers.remove(transfer_id) {
                active.discard();
            }
            warn!(conn_id = %self.conn_id, %transfer_id, "transfer stalled, discarding");
            self.reply(Frame::transfer_error(
                transfer_id.clone(),
                format!(
                    "transfer stalled: no chunk received for {}s",
                    timeout.as_secs()
                ),
            ));
        }
        stalled.len()
    }

    /// Cancels every progress reporter and discards all partial transfers.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let count = self.transfers.len();
        for (_, active) in self.transfers.drain() {
            active.discard();
        }
        if count > 0 {
            info!(conn_id = %self.conn_id, count, "discarded incomplete transfers");
        }
    }

    fn reply(&self, frame: Frame) {
        if let Err(e) = self.sender.send_frame(&frame) {
            debug!(conn_id = %self.conn_id, frame_type = %frame.frame_type(), "reply dropped: {e}");
        }
    }
}

impl<S: Sink> Drop for ConnectionState<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use kuro_protocol::encode_binary;
    use kuro_transfer::{CollisionPolicy, DirectorySink, StoreFuture};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    use super::*;

    struct Harness {
        state: ConnectionState<DirectorySink>,
        rx: mpsc::Receiver<WsMessage>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(settings: TransferSettings) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let sink = DirectorySink::new(dir.path(), CollisionPolicy::Rename).unwrap();
            let (sender, rx) = Sender::channel(64);
            Self {
                state: ConnectionState::new("conn-1", sender, Arc::new(sink), settings),
                rx,
                dir,
            }
        }

        fn frames(&mut self) -> Vec<Frame> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    WsMessage::Text(text) => out.push(decode(&text).unwrap()),
                    other => panic!("unexpected message {other:?}"),
                }
            }
            out
        }

        fn stored(&self, name: &str) -> Option<Vec<u8>> {
            std::fs::read(self.dir.path().join(name)).ok()
        }

        fn stored_count(&self) -> usize {
            std::fs::read_dir(self.dir.path()).unwrap().count()
        }
    }

    fn settings() -> TransferSettings {
        TransferSettings {
            progress_interval: Duration::from_secs(3600),
            ..TransferSettings::default()
        }
    }

    fn chunk_text(id: &str, name: &str, index: i64, total: i64, data: &[u8]) -> String {
        serde_json::json!({
            "type": "file_chunk",
            "transferId": id,
            "filename": name,
            "chunkIndex": index,
            "totalChunks": total,
            "chunk": STANDARD.encode(data),
        })
        .to_string()
    }

    fn chunk_frame(id: &str, index: i64, total: i64, data: &[u8]) -> Frame {
        Frame::FileChunk(FileChunk {
            transfer_id: id.into(),
            filename: "file.bin".into(),
            chunk_index: index,
            total_chunks: total,
            chunk: data.to_vec(),
        })
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble() {
        let mut h = Harness::new(settings());
        for (index, data) in [(2, b"C"), (0, b"A"), (1, b"B")] {
            h.state
                .handle_text(&chunk_text("t1", "notes.txt", index, 3, data))
                .await;
        }

        assert_eq!(h.frames(), vec![Frame::success("t1", "notes.txt")]);
        assert_eq!(h.stored("notes.txt").as_deref(), Some(&b"ABC"[..]));
        assert!(!h.state.has_transfer("t1"));
    }

    #[tokio::test]
    async fn duplicate_chunk_completes_once() {
        let mut h = Harness::new(settings());
        for index in [1, 1] {
            h.state.handle_frame(chunk_frame("t1", index, 3, b"B")).await;
        }
        h.state.handle_frame(chunk_frame("t1", 0, 3, b"A")).await;
        assert!(h.frames().is_empty());
        assert!(h.state.has_transfer("t1"));

        h.state.handle_frame(chunk_frame("t1", 2, 3, b"C")).await;
        let frames = h.frames();
        assert_eq!(frames, vec![Frame::success("t1", "file.bin")]);
        assert_eq!(h.stored("file.bin").as_deref(), Some(&b"ABC"[..]));
    }

    #[tokio::test]
    async fn out_of_range_chunk_is_rejected_and_transfer_completes() {
        let mut h = Harness::new(settings());
        h.state.handle_frame(chunk_frame("t1", 0, 3, b"A")).await;
        h.state.handle_frame(chunk_frame("t1", 5, 3, b"X")).await;

        let frames = h.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type(), kuro_protocol::FrameType::Error);
        assert_eq!(frames[0].transfer_id(), Some("t1"));

        h.state.handle_frame(chunk_frame("t1", 1, 3, b"B")).await;
        h.state.handle_frame(chunk_frame("t1", 2, 3, b"C")).await;
        assert_eq!(h.frames(), vec![Frame::success("t1", "file.bin")]);
        assert_eq!(h.stored("file.bin").as_deref(), Some(&b"ABC"[..]));
    }

    #[tokio::test]
    async fn invalid_first_chunk_creates_nothing() {
        let mut h = Harness::new(settings());
        h.state.handle_frame(chunk_frame("t1", 0, 0, b"A")).await;
        h.state.handle_frame(chunk_frame("t2", 3, 3, b"A")).await;

        let frames = h.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].transfer_id(), Some("t1"));
        assert_eq!(frames[1].transfer_id(), Some("t2"));
        assert_eq!(h.state.active_transfers(), 0);
    }

    #[tokio::test]
    async fn total_chunks_mismatch_keeps_state() {
        let mut h = Harness::new(settings());
        h.state.handle_frame(chunk_frame("t1", 0, 2, b"A")).await;
        h.state.handle_frame(chunk_frame("t1", 1, 3, b"B")).await;

        match h.frames().as_slice() {
            [Frame::Error(e)] => {
                assert_eq!(e.transfer_id.as_deref(), Some("t1"));
                assert!(e.message.contains("mismatch"));
            }
            other => panic!("expected one error, got {other:?}"),
        }
        h.state.handle_frame(chunk_frame("t1", 1, 2, b"B")).await;
        assert_eq!(h.frames(), vec![Frame::success("t1", "file.bin")]);
    }

    #[tokio::test]
    async fn single_chunk_transfer() {
        let mut h = Harness::new(settings());
        h.state
            .handle_text(&chunk_text("solo", "one.txt", 0, 1, b"only"))
            .await;
        assert_eq!(h.frames(), vec![Frame::success("solo", "one.txt")]);
        assert_eq!(h.state.active_transfers(), 0);
    }

    #[tokio::test]
    async fn interleaved_transfers() {
        let mut h = Harness::new(settings());
        h.state.handle_text(&chunk_text("a", "a.txt", 1, 2, b"2")).await;
        h.state.handle_text(&chunk_text("b", "b.txt", 0, 2, b"x")).await;
        assert_eq!(h.state.active_transfers(), 2);
        h.state.handle_text(&chunk_text("a", "a.txt", 0, 2, b"1")).await;
        h.state.handle_text(&chunk_text("b", "b.txt", 1, 2, b"y")).await;

        assert_eq!(
            h.frames(),
            vec![Frame::success("a", "a.txt"), Frame::success("b", "b.txt")]
        );
        assert_eq!(h.stored("a.txt").as_deref(), Some(&b"12"[..]));
        assert_eq!(h.stored("b.txt").as_deref(), Some(&b"xy"[..]));
    }

    #[tokio::test]
    async fn binary_and_json_chunks_share_a_transfer() {
        let mut h = Harness::new(settings());
        h.state.handle_text(&chunk_text("t1", "mix.bin", 0, 2, b"json-")).await;

        let binary = encode_binary(&FileChunk {
            transfer_id: "t1".into(),
            filename: "mix.bin".into(),
            chunk_index: 1,
            total_chunks: 2,
            chunk: b"binary".to_vec(),
        })
        .unwrap();
        h.state.handle_binary(&binary).await;

        assert_eq!(h.frames(), vec![Frame::success("t1", "mix.bin")]);
        assert_eq!(h.stored("mix.bin").as_deref(), Some(&b"json-binary"[..]));
    }

    #[tokio::test]
    async fn filename_is_sanitized_before_storing() {
        let mut h = Harness::new(settings());
        h.state
            .handle_text(&chunk_text("t1", "../../secret/passwd", 0, 1, b"x"))
            .await;
        assert_eq!(h.frames(), vec![Frame::success("t1", "_.._secret_passwd")]);
        assert!(h.stored("_.._secret_passwd").is_some());
    }

    #[tokio::test]
    async fn protocol_errors_keep_connection_usable() {
        let mut h = Harness::new(settings());
        h.state.handle_text("not json").await;
        h.state.handle_text(r#"{"type":"bogus"}"#).await;
        h.state
            .handle_text(r#"{"type":"file_chunk","transferId":"t9"}"#)
            .await;
        h.state.handle_frame(Frame::progress("t9", 1, 2)).await;
        h.state.handle_binary(&[0, 1]).await;

        let frames = h.frames();
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| matches!(f, Frame::Error(_))));
        assert_eq!(frames[0].transfer_id(), None);
        assert_eq!(frames[2].transfer_id(), Some("t9"));
        assert_eq!(frames[3].transfer_id(), Some("t9"));
        assert_eq!(h.state.active_transfers(), 0);

        h.state.handle_text(&chunk_text("ok", "ok.txt", 0, 1, b"fine")).await;
        assert_eq!(h.frames(), vec![Frame::success("ok", "ok.txt")]);
    }

    #[tokio::test]
    async fn empty_transfer_id_is_rejected() {
        let mut h = Harness::new(settings());
        h.state.handle_frame(chunk_frame("", 0, 1, b"x")).await;
        match h.frames().as_slice() {
            [Frame::Error(e)] => assert!(e.transfer_id.is_none()),
            other => panic!("expected one error, got {other:?}"),
        }
        assert_eq!(h.stored_count(), 0);
    }

    #[tokio::test]
    async fn per_connection_transfer_cap() {
        let mut h = Harness::new(TransferSettings {
            limits: TransferLimits {
                max_transfers_per_connection: 2,
                ..TransferLimits::default()
            },
            ..settings()
        });
        for id in ["a", "b", "c"] {
            h.state.handle_frame(chunk_frame(id, 0, 2, b"x")).await;
        }
        assert_eq!(h.state.active_transfers(), 2);
        match h.frames().as_slice() {
            [Frame::Error(e)] => {
                assert_eq!(e.transfer_id.as_deref(), Some("c"));
                assert!(e.message.contains("too many"));
            }
            other => panic!("expected one error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_discards_everything_and_is_idempotent() {
        let mut h = Harness::new(settings());
        h.state.handle_frame(chunk_frame("t1", 0, 3, b"A")).await;
        h.state.handle_frame(chunk_frame("t2", 0, 2, b"A")).await;

        h.state.close();
        h.state.close();
        assert!(h.state.is_closed());
        assert_eq!(h.state.active_transfers(), 0);

        // Late chunks after close are ignored.
        h.state.handle_frame(chunk_frame("t2", 1, 2, b"B")).await;
        assert!(h.frames().is_empty());
        assert_eq!(h.stored_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reports_until_completion() {
        let mut h = Harness::new(TransferSettings {
            progress_interval: Duration::from_secs(1),
            ..TransferSettings::default()
        });
        h.state.handle_frame(chunk_frame("t1", 0, 3, b"A")).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.state.handle_frame(chunk_frame("t1", 0, 3, b"A")).await;
        h.state.handle_frame(chunk_frame("t1", 2, 3, b"C")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            h.frames(),
            vec![Frame::progress("t1", 1, 3), Frame::progress("t1", 2, 3)]
        );

        h.state.handle_frame(chunk_frame("t1", 1, 3, b"B")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.frames(), vec![Frame::success("t1", "file.bin")]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_progress() {
        let mut h = Harness::new(TransferSettings {
            progress_interval: Duration::from_secs(1),
            ..TransferSettings::default()
        });
        h.state.handle_frame(chunk_frame("t1", 0, 2, b"A")).await;
        h.state.close();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.frames().is_empty());
    }

    #[tokio::test]
    async fn stalled_transfers_expire() {
        let mut h = Harness::new(settings());
        h.state.handle_frame(chunk_frame("t1", 0, 2, b"A")).await;

        let soon = Instant::now() + Duration::from_secs(10);
        assert_eq!(h.state.expire_stalled(soon), 0);
        assert!(h.state.has_transfer("t1"));

        let later = Instant::now() + DEFAULT_STALL_TIMEOUT + Duration::from_secs(1);
        assert_eq!(h.state.expire_stalled(later), 1);
        assert!(!h.state.has_transfer("t1"));

        match h.frames().as_slice() {
            [Frame::Error(e)] => {
                assert_eq!(e.transfer_id.as_deref(), Some("t1"));
                assert!(e.message.contains("stalled"));
            }
            other => panic!("expected one error, got {other:?}"),
        }
        assert_eq!(h.stored_count(), 0);

        // A fresh chunk starts the transfer over.
        h.state.handle_frame(chunk_frame("t1", 1, 2, b"B")).await;
        assert!(h.state.has_transfer("t1"));
    }

    #[tokio::test]
    async fn stall_expiry_can_be_disabled() {
        let mut h = Harness::new(TransferSettings {
            stall_timeout: None,
            ..settings()
        });
        h.state.handle_frame(chunk_frame("t1", 0, 2, b"A")).await;
        let far = Instant::now() + Duration::from_secs(86_400);
        assert_eq!(h.state.expire_stalled(far), 0);
        assert!(h.state.has_transfer("t1"));
    }

    #[test]
    fn sweep_period_is_bounded() {
        let mut s = TransferSettings::default();
        assert_eq!(s.sweep_period(), Some(Duration::from_secs(30)));
        s.stall_timeout = Some(Duration::from_secs(10));
        assert_eq!(s.sweep_period(), Some(Duration::from_secs(5)));
        s.stall_timeout = None;
        assert_eq!(s.sweep_period(), None);
    }

    struct FailingSink;

    impl Sink for FailingSink {
        fn store(&self, _filename: String, _bytes: Vec<u8>) -> StoreFuture<'_> {
            Box::pin(async { Err::<String, _>(TransferError::Io(std::io::Error::other("disk full"))) })
        }
    }

    #[tokio::test]
    async fn persistence_failure_reports_error_and_ends_transfer() {
        let (sender, mut rx) = Sender::channel(16);
        let mut state = ConnectionState::new("conn-2", sender, Arc::new(FailingSink), settings());
        state.handle_frame(chunk_frame("t1", 0, 1, b"A")).await;

        match rx.try_recv().unwrap() {
            WsMessage::Text(text) => match decode(&text).unwrap() {
                Frame::Error(e) => {
                    assert_eq!(e.transfer_id.as_deref(), Some("t1"));
                    assert!(e.message.contains("disk full"));
                }
                other => panic!("expected error, got {other:?}"),
            },
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(state.active_transfers(), 0);
    }
}
