//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades every accepted connection to WebSocket
//! and runs it until the client leaves or the server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kuro_protocol::constants::WS_MAX_MESSAGE_SIZE;
use kuro_transfer::Sink;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ServerError;
use crate::connection;
use crate::state::TransferSettings;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Connections beyond this are refused before the WebSocket upgrade.
    pub max_connections: usize,
    /// Largest WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    pub transfer: TransferSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 0,
            max_connections: 256,
            max_message_size: WS_MAX_MESSAGE_SIZE,
            transfer: TransferSettings::default(),
        }
    }
}

/// The upload WebSocket server.
///
/// Every connection gets its own transfers; completed files go to the
/// shared [`Sink`].
pub struct UploadServer<S: Sink> {
    config: ServerConfig,
    sink: Arc<S>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    active: Arc<AtomicUsize>,
}

/// Decrements the active connection count when a connection task ends,
/// however it ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: Sink> UploadServer<S> {
    /// Creates a new server storing completed uploads in `sink`.
    pub fn new(config: ServerConfig, sink: S) -> Arc<Self> {
        Arc::new(Self {
            config,
            sink: Arc::new(sink),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Returns the listening port (0 until [`run`](Self::run) binds the socket).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    ///
    /// Returns once every connection has been torn down.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("upload server listening on {local_addr}");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task failed: {e}");
                    }
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let guard = match self.admit() {
                                Ok(guard) => guard,
                                Err(e) => {
                                    warn!(%peer_addr, "rejecting connection: {e}");
                                    continue;
                                }
                            };
                            let server = Arc::clone(self);
                            connections.spawn(async move {
                                let _guard = guard;
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("connection task failed: {e}");
            }
        }
        info!("server stopped");
        Ok(())
    }

    /// Reserves a connection slot.
    fn admit(&self) -> Result<ActiveGuard, ServerError> {
        let max = self.config.max_connections;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ActiveGuard(Arc::clone(&self.active)))
            .map_err(|_| ServerError::ConnectionLimit(max))
    }

    /// Upgrades a TCP connection to WebSocket and serves it.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let cancel = self.cancel.child_token();
        let ws_stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            upgraded = accept_async_with_config(stream, Some(ws_config)) => upgraded?,
        };

        let conn_id = uuid::Uuid::new_v4().to_string();
        info!(%conn_id, %peer_addr, "WebSocket connection established");

        connection::run_connection(
            ws_stream,
            conn_id,
            peer_addr,
            Arc::clone(&self.sink),
            self.config.transfer,
            cancel,
        )
        .await;

        Ok(())
    }
}
