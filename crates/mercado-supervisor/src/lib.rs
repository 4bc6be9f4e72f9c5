//! Process topology: a single FORK process, or a CLUSTER primary that keeps
//! one worker process per CPU alive.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod launcher;
pub mod mode;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use config::{RestartPolicy, SupervisorConfig};
pub use dispatch::{plan, Launch};
pub use error::SupervisorError;
pub use launcher::{ChildWorker, CommandLauncher, Worker, WorkerExit, WorkerLauncher};
pub use mode::{Mode, Role, ROLE_ENV};
pub use shutdown::{shutdown_signal, signal_token};
pub use supervisor::{Supervisor, SupervisorStats};
pub use worker::run_worker;
