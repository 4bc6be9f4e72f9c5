//! CLUSTER primary: keep `worker_count` workers alive until shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::launcher::WorkerLauncher;

/// Live view of the worker pool.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    live: AtomicUsize,
    spawned: AtomicU64,
    restarts: AtomicU64,
    pids: Mutex<BTreeMap<usize, u32>>,
}

impl SupervisorStats {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total successful launches, first generation included.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Workers that died and were replaced (or are waiting to be).
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Current worker pids by slot.
    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().values().copied().collect()
    }

    fn started(&self, slot: usize, pid: Option<u32>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        if let Some(pid) = pid {
            self.pids.lock().insert(slot, pid);
        }
    }

    fn stopped(&self, slot: usize) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.pids.lock().remove(&slot);
    }
}

pub struct Supervisor<L: WorkerLauncher> {
    config: SupervisorConfig,
    launcher: Arc<L>,
    stats: Arc<SupervisorStats>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(config: SupervisorConfig, launcher: L) -> Self {
        Self {
            config,
            launcher: Arc::new(launcher),
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the pool and replace every worker that exits, until `shutdown`
    /// fires. Workers are killed before this returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            pid = std::process::id(),
            workers = self.config.worker_count,
            "primary started"
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.config.worker_count {
            slots.spawn(run_slot(
                slot,
                Arc::clone(&self.launcher),
                self.config.clone(),
                Arc::clone(&self.stats),
                shutdown.clone(),
            ));
        }

        while let Some(result) = slots.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "worker slot task failed");
            }
        }

        info!(pid = std::process::id(), "primary stopped, exit code: 0");
    }
}

/// Keep one slot filled until shutdown.
async fn run_slot<L: WorkerLauncher>(
    slot: usize,
    launcher: Arc<L>,
    config: SupervisorConfig,
    stats: Arc<SupervisorStats>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut worker = match launcher.launch(slot) {
            Ok(worker) => worker,
            Err(e) => {
                warn!(slot, error = %e, "worker spawn failed, retrying");
                let delay = config.restart.spawn_retry_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let pid = worker.pid();
        stats.started(slot, pid);
        info!(slot, pid = ?pid, "worker started");

        tokio::select! {
            exit = worker.wait() => {
                stats.stopped(slot);
                stats.restarts.fetch_add(1, Ordering::SeqCst);
                warn!(
                    slot,
                    pid = ?exit.pid,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "worker died ({exit}), reforking"
                );
            }
            _ = shutdown.cancelled() => {
                worker.kill().await;
                stats.stopped(slot);
                info!(slot, pid = ?pid, "worker stopped");
                return;
            }
        }

        if let Some(delay) = config.restart.backoff {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
