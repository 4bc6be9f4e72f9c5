//! The serving side: a FORK process or a CLUSTER worker.

use std::sync::Arc;

use mercado_server::{Broadcaster, ServerConfig, ServerError};
use mercado_telemetry::IncidentLog;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Serve until `shutdown` fires.
///
/// A listener that fails to bind, or a serve loop that dies, is logged and
/// the process keeps waiting for a termination signal instead of exiting.
pub async fn run_worker(
    config: ServerConfig,
    broadcaster: Arc<Broadcaster>,
    incidents: Option<Arc<IncidentLog>>,
    shutdown: CancellationToken,
) {
    let port = config.port;
    let role = config.role.clone();

    match mercado_server::start(config, broadcaster, incidents).await {
        Ok(mut handle) => {
            let stopped = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = handle.stopped() => Some(result),
            };
            match stopped {
                None => handle.shutdown().await,
                Some(result) => {
                    log_transport_error(port, &role, result.err());
                    shutdown.cancelled().await;
                }
            }
        }
        Err(e) => {
            log_transport_error(port, &role, Some(e));
            shutdown.cancelled().await;
        }
    }

    info!(pid = std::process::id(), %role, "exit code: 0");
}

fn log_transport_error(port: u16, role: &str, err: Option<ServerError>) {
    match err {
        Some(e) => error!(port, role, pid = std::process::id(), error = %e, "listener error"),
        None => error!(port, role, pid = std::process::id(), "listener stopped unexpectedly"),
    }
}
