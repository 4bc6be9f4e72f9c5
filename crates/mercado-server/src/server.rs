use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use mercado_telemetry::IncidentLog;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::oneshot;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broadcaster::Broadcaster;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry;
use crate::routes;
use crate::socket;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub config: Arc<ServerConfig>,
    /// Port actually bound (differs from config when it asked for 0).
    pub port: u16,
    pub started: Instant,
    /// Persisted warn/error events, when incident logging is on.
    pub incidents: Option<Arc<IncidentLog>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let http = Router::new()
        .route("/health", get(routes::health_handler))
        .route("/info", get(routes::info_handler))
        .route("/incidents", get(routes::incidents_handler))
        .fallback(routes::not_found)
        .layer(CompressionLayer::new());

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(http)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listening socket. With `reuse_port` several processes may bind
/// the same address and the kernel spreads accepted connections among them.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(reuse_port)?;
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Bind and serve. Returns once the listener is up.
pub async fn start(
    config: ServerConfig,
    broadcaster: Arc<Broadcaster>,
    incidents: Option<Arc<IncidentLog>>,
) -> Result<ServerHandle, ServerError> {
    let listener = bind_listener(config.addr(), config.reuse_port)?;
    let local_addr = listener.local_addr()?;

    let cleanup = registry::start_cleanup_task(
        Arc::clone(broadcaster.registry()),
        config.heartbeat_interval,
        config.client_timeout,
    );

    let state = AppState {
        broadcaster,
        config: Arc::new(config),
        port: local_addr.port(),
        started: Instant::now(),
        incidents,
    };
    let router = build_router(state);

    tracing::info!(
        port = local_addr.port(),
        pid = std::process::id(),
        "server is up on http://localhost:{}",
        local_addr.port()
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
        shutdown_tx: Some(shutdown_tx),
        _cleanup: cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Resolves when the serve loop ends on its own, which only happens on
    /// a transport error.
    pub async fn stopped(&mut self) -> Result<(), ServerError> {
        match (&mut self.server).await {
            Ok(result) => result.map_err(ServerError::from),
            Err(e) => Err(ServerError::Transport(std::io::Error::other(e))),
        }
    }

    /// Stop accepting, let in-flight requests finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.server).await;
        self._cleanup.abort();
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let heartbeat = state.config.heartbeat_interval;
    ws.on_upgrade(move |socket| socket::serve_connection(socket, state.broadcaster, heartbeat))
}
