use std::time::Duration;

use crate::mode::Mode;

/// Delay applied before replacing a dead worker. `None` replaces at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestartPolicy {
    pub backoff: Option<Duration>,
}

impl RestartPolicy {
    pub fn immediate() -> Self {
        Self { backoff: None }
    }

    pub fn with_backoff(delay: Duration) -> Self {
        Self {
            backoff: Some(delay),
        }
    }

    /// Wait before retrying a spawn that failed. Never zero, so a broken
    /// executable cannot spin the primary.
    pub fn spawn_retry_delay(&self) -> Duration {
        self.backoff.unwrap_or(SPAWN_RETRY_FLOOR).max(SPAWN_RETRY_FLOOR)
    }
}

const SPAWN_RETRY_FLOOR: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub mode: Mode,
    pub worker_count: usize,
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Fork,
            worker_count: available_cpus(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Logical CPUs visible to this process, at least 1.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
