//! # mercado
//!
//! Realtime chat backend binary. Runs as a single process (`fork`) or as a
//! primary that keeps one worker per CPU alive (`cluster`).

#![deny(unsafe_code)]

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mercado_core::SystemClock;
use mercado_server::{Broadcaster, ServerConfig};
use mercado_store::{Database, SqliteMessageStore};
use mercado_supervisor::{
    config::available_cpus, plan, run_worker, signal_token, CommandLauncher, Launch, Mode,
    RestartPolicy, Role, Supervisor, SupervisorConfig,
};
use mercado_telemetry::{init_telemetry, IncidentLog, TelemetryConfig};
use tracing::{error, info};

/// Mercado chat server.
#[derive(Parser, Debug)]
#[command(name = "mercado", about = "Realtime chat server")]
struct Cli {
    /// Process mode: fork or cluster (case-insensitive).
    #[arg(value_name = "MODE")]
    mode_arg: Option<String>,

    /// Same as the positional MODE.
    #[arg(long, conflicts_with = "mode_arg")]
    mode: Option<String>,

    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to bind.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Path to the `SQLite` message database.
    #[arg(long, env = "MERCADO_DB")]
    db: Option<PathBuf>,

    /// Worker processes in cluster mode (defaults to the CPU count).
    #[arg(long)]
    workers: Option<usize>,

    /// Delay before replacing a dead worker.
    #[arg(long)]
    restart_backoff_ms: Option<u64>,

    /// Skip persisting warn+ logs to the log database.
    #[arg(long)]
    no_log_db: bool,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        mercado_telemetry::data_dir().join("database").join("chat.db")
    }

    fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let raw = self.mode_arg.as_deref().or(self.mode.as_deref());
        let mode = Mode::parse(raw)?;
        Ok(SupervisorConfig {
            mode,
            worker_count: self.workers.unwrap_or_else(available_cpus).max(1),
            restart: RestartPolicy {
                backoff: self.restart_backoff_ms.map(Duration::from_millis),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        persist_incidents: !cli.no_log_db,
        ..Default::default()
    });

    let result = run(cli, telemetry.incidents()).await;
    match &result {
        Ok(()) => {}
        Err(e) => error!(pid = std::process::id(), error = ?e, "exit code: 1"),
    }
    result
}

async fn run(cli: Cli, incidents: Option<Arc<IncidentLog>>) -> Result<()> {
    let supervisor_config = cli.supervisor_config()?;
    let role = Role::detect();
    info!(
        pid = std::process::id(),
        mode = %supervisor_config.mode,
        role = role.as_str(),
        "mercado starting"
    );

    let base = ServerConfig {
        host: cli.host,
        port: cli.port,
        ..Default::default()
    };
    let shutdown = signal_token();

    match plan(supervisor_config.mode, role, base) {
        Launch::Supervise => {
            let launcher = CommandLauncher::current_exe()?;
            let supervisor = Supervisor::new(supervisor_config, launcher);
            supervisor.run(shutdown).await;
        }
        Launch::Serve(config) => {
            let db_path = cli.db.clone().unwrap_or_else(Cli::default_db_path);
            let db = Database::open(&db_path)
                .with_context(|| format!("failed to open message store at {}", db_path.display()))?;
            let broadcaster = Arc::new(Broadcaster::new(
                Arc::new(SqliteMessageStore::new(db)),
                Arc::new(SystemClock),
                config.max_send_queue,
            ));

            run_worker(config, broadcaster, incidents, shutdown).await;
        }
    }

    Ok(())
}
