//! Uploader connection: read/write pumps, ping/pong, send buffering.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use kuro_protocol::Frame;
use kuro_protocol::constants::{WS_PING_PERIOD, WS_PONG_WAIT};
use kuro_transfer::Sink;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SEND_BUFFER_SIZE;
use crate::state::{ConnectionState, TransferSettings};

/// Handle for sending frames to the connected uploader.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Creates a sender and the receiving end drained by the write pump.
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Sends a protocol [`Frame`] as JSON text.
    ///
    /// Fails if the buffer is full or the connection is gone.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let json = kuro_protocol::encode(frame).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|e| {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                warn!(frame_type = %frame.frame_type(), "send buffer full, dropping frame");
            }
            SendError
        })
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Runs one uploader connection to completion.
///
/// The write pump runs as its own task; the read pump runs here and feeds
/// the connection's [`ConnectionState`]. Whatever ends the read pump, the
/// state is closed before this returns.
pub(crate) async fn run_connection<W, S>(
    ws_stream: W,
    conn_id: String,
    peer_addr: SocketAddr,
    sink: Arc<S>,
    settings: TransferSettings,
    cancel: CancellationToken,
) where
    W: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    S: Sink,
{
    let (sender, rx) = Sender::channel(SEND_BUFFER_SIZE);
    let (ws_sink, ws_stream) = ws_stream.split();

    let writer = tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let mut state = ConnectionState::new(conn_id.clone(), sender.clone(), sink, settings);
    let reason = read_pump(ws_stream, &sender, &mut state, &cancel).await;

    state.close();
    cancel.cancel();
    if let Err(e) = writer.await {
        warn!(%conn_id, "write pump task failed: {e}");
    }
    info!(%conn_id, %peer_addr, reason, "connection closed");
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<W>(mut sink: W, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    W: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and hands them to the connection state.
///
/// Returns why the connection ended.
async fn read_pump<R, S>(
    mut stream: R,
    sender: &Sender,
    state: &mut ConnectionState<S>,
    cancel: &CancellationToken,
) -> &'static str
where
    R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    S: Sink,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_message = true;

    let sweep_period = state.settings().sweep_period();
    let mut sweep = tokio::time::interval(sweep_period.unwrap_or(WS_PONG_WAIT));
    sweep.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return "server shutdown",

            _ = pong_deadline.tick() => {
                if !got_message {
                    warn!(conn_id = %state.conn_id(), "pong timeout, closing connection");
                    return "pong timeout";
                }
                got_message = false;
            }

            _ = sweep.tick(), if sweep_period.is_some() => {
                state.expire_stalled(std::time::Instant::now());
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(ws_msg)) => ws_msg,
                    Some(Err(e)) => {
                        warn!(conn_id = %state.conn_id(), "read pump error: {e}");
                        return "read error";
                    }
                    None => return "stream ended",
                };

                got_message = true;
                pong_deadline.reset();

                match ws_msg {
                    WsMessage::Text(text) => state.handle_text(&text).await,
                    WsMessage::Binary(data) => state.handle_binary(&data).await,
                    WsMessage::Ping(data) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => return "client closed",
                    WsMessage::Frame(_) => {} // Raw frames ignored.
                }
            }
        }
    }
}
