//! Plain HTTP routes sharing the listener with the chat socket.

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use mercado_telemetry::{Incident, IncidentFilter};
use serde::Serialize;

use crate::server::AppState;

/// Health check.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.broadcaster.connection_count(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub mode: String,
    pub role: String,
    pub port: u16,
    pub cpus: usize,
    pub connections: usize,
    pub uptime_secs: u64,
    /// `None` when the store could not be read.
    pub stored_messages: Option<u64>,
    /// Time of this process's newest warn/error incident.
    pub last_incident_at: Option<String>,
}

/// Process and topology details for this worker.
pub async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stored_messages = match state.broadcaster.store().count().await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "message count unavailable");
            None
        }
    };

    let pid = std::process::id();
    let last_incident_at = match state.incidents.clone() {
        Some(log) => tokio::task::spawn_blocking(move || log.last_seen(pid))
            .await
            .ok()
            .and_then(Result::ok)
            .flatten(),
        None => None,
    };

    Json(ProcessInfo {
        pid,
        mode: state.config.mode.clone(),
        role: state.config.role.clone(),
        port: state.port,
        cpus: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        connections: state.broadcaster.connection_count(),
        uptime_secs: state.started.elapsed().as_secs(),
        stored_messages,
        last_incident_at,
    })
}

#[derive(Debug, Serialize)]
pub struct IncidentsResponse {
    pub enabled: bool,
    pub incidents: Vec<Incident>,
}

/// Persisted warn/error events from every process sharing the incident log.
/// Filters: `pid`, `connection_id`, `level=error`, `limit`.
pub async fn incidents_handler(
    State(state): State<AppState>,
    Query(filter): Query<IncidentFilter>,
) -> impl IntoResponse {
    let Some(log) = state.incidents.clone() else {
        return (
            StatusCode::OK,
            Json(IncidentsResponse {
                enabled: false,
                incidents: Vec::new(),
            }),
        );
    };

    match tokio::task::spawn_blocking(move || log.recent(&filter)).await {
        Ok(Ok(incidents)) => (
            StatusCode::OK,
            Json(IncidentsResponse {
                enabled: true,
                incidents,
            }),
        ),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "incident log read failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(IncidentsResponse {
                    enabled: true,
                    incidents: Vec::new(),
                }),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "incident log task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IncidentsResponse {
                    enabled: true,
                    incidents: Vec::new(),
                }),
            )
        }
    }
}

/// JSON 404 for anything not routed.
pub async fn not_found(method: Method, uri: Uri) -> impl IntoResponse {
    tracing::warn!(%method, path = %uri.path(), "unknown route");
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": -2,
            "description": format!("route {} method {} not implemented", uri.path(), method),
        })),
    )
}
