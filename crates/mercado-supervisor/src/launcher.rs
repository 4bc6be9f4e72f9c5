//! Spawning worker processes.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::SupervisorError;
use crate::mode::ROLE_ENV;

/// How a worker process ended. Logged by the primary, never propagated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub pid: Option<u32>,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn from_status(pid: Option<u32>, status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            pid,
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code: {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

/// A running worker.
#[async_trait]
pub trait Worker: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolve when the worker ends, for whatever reason.
    async fn wait(&mut self) -> WorkerExit;

    /// Terminate and reap.
    async fn kill(&mut self);
}

/// Starts workers. `slot` is the stable index the worker fills.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, slot: usize) -> Result<Box<dyn Worker>, SupervisorError>;
}

/// Launches an executable as a child process.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable with the same arguments as a worker.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::Spawn)?;
        Ok(Self::new(program)
            .args(std::env::args_os().skip(1))
            .env(ROLE_ENV, "worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, slot: usize) -> Result<Box<dyn Worker>, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let worker = ChildWorker::new(child);
        tracing::debug!(slot, pid = ?worker.pid(), program = %self.program.display(), "worker spawned");
        Ok(Box::new(worker))
    }
}

/// Worker backed by a `tokio::process::Child`.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
    pid: Option<u32>,
}

impl ChildWorker {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }
}

#[async_trait]
impl Worker for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> WorkerExit {
        match self.child.wait().await {
            Ok(status) => WorkerExit::from_status(self.pid, status),
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "failed to wait on worker");
                WorkerExit {
                    pid: self.pid,
                    code: None,
                    signal: None,
                }
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(pid = ?self.pid, error = %e, "worker already gone");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_code_is_reported() {
        let launcher = CommandLauncher::new("sh").args(["-c", "exit 3"]);
        let mut worker = launcher.launch(0).unwrap();
        let pid = worker.pid();
        let exit = worker.wait().await;
        assert_eq!(exit.pid, pid);
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
        assert_eq!(exit.to_string(), "exit code: 3");
    }

    #[tokio::test]
    async fn kill_reports_signal() {
        let launcher = CommandLauncher::new("sleep").arg("30");
        let mut worker = launcher.launch(0).unwrap();
        worker.kill().await;
        let exit = worker.wait().await;
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test]
    async fn env_reaches_child() {
        let launcher = CommandLauncher::new("sh")
            .args(["-c", "test \"$MERCADO_ROLE\" = worker"])
            .env(ROLE_ENV, "worker");
        let mut worker = launcher.launch(0).unwrap();
        assert_eq!(worker.wait().await.code, Some(0));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let launcher = CommandLauncher::new("/nonexistent/mercado-worker");
        let err = launcher.launch(0).err().unwrap();
        assert!(matches!(err, SupervisorError::Spawn(_)));
    }
}
