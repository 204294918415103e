//! Application orchestrator: storage, upload server and shutdown signals.

use std::sync::Arc;

use kuro_transfer::DirectorySink;
use kuro_upload_server::UploadServer;

use crate::config::Config;

/// Runs the service until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let sink = DirectorySink::new(
        config.server.storage_dir.clone(),
        config.server.collision_policy,
    )?;
    tracing::info!(
        dir = %sink.dir().display(),
        policy = ?sink.policy(),
        "storing uploads"
    );

    let server = UploadServer::new(config.server_config(), sink);
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        joined = &mut server_task => {
            // The server only returns on its own when binding fails.
            joined??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("stopping upload server...");
    server.shutdown();
    server_task.await??;
    Ok(())
}

/// Resolves on the first shutdown signal.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
                    _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                }
                return;
            }
            Err(e) => tracing::warn!("cannot listen for SIGTERM: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("SIGINT received, shutting down");
}
