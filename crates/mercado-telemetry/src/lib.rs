mod incidents;

pub use incidents::{Incident, IncidentFilter, IncidentLayer, IncidentLog, MAX_INCIDENTS};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "mercado_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ events as incidents.
    pub persist_incidents: bool,
    /// Incident database. Shared by the primary and every worker.
    pub incident_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            persist_incidents: true,
            incident_db_path: data_dir().join("database/logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Filter directive used when RUST_LOG is unset.
    pub fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Returned by [`init_telemetry`]; holds the incident log if one was opened.
pub struct TelemetryGuard {
    incidents: Option<Arc<IncidentLog>>,
}

impl TelemetryGuard {
    /// Shared handle for reading incidents back (served on `/incidents`).
    pub fn incidents(&self) -> Option<Arc<IncidentLog>> {
        self.incidents.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    // JSON formatting layer for stdout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    // Subscriber isn't up yet, so an open failure can only go to stderr
    let incidents = if config.persist_incidents {
        IncidentLog::open(&config.incident_db_path)
            .map(Arc::new)
            .map_err(|e| eprintln!("mercado-telemetry: incident log unavailable: {e}"))
            .ok()
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(incidents.clone().map(IncidentLayer::new))
        .init();

    TelemetryGuard { incidents }
}

/// Base directory for default database paths.
pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".mercado")
}
