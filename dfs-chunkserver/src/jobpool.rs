//! Disk job pool: runs blocking chunk-file I/O on `spawn_blocking`, gated by
//! a semaphore sized to `hdd_workers_per_network_worker`, with completions
//! delivered back over an `mpsc` channel standing in for the original's
//! wake-up pipe between the network and disk worker threads.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use dfs_proto::types::WriteId;
use dfs_proto::Status;

/// Result of one completed disk job, routed back to the connection that
/// submitted it.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub write_id: WriteId,
    pub block: u32,
    pub status: Status,
}

/// Bounds how many blocking disk jobs may run concurrently for one network
/// worker task (§4.3 "Background job pool").
pub struct JobPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    results_tx: mpsc::Sender<JobResult>,
}

impl JobPool {
    pub fn new(max_concurrent: usize, results_tx: mpsc::Sender<JobResult>) -> Self {
        let capacity = max_concurrent.max(1);
        JobPool { permits: Arc::new(Semaphore::new(capacity)), capacity, results_tx }
    }

    /// Fraction of permits currently checked out, used by the acceptor to
    /// decide whether to refuse new connections (`JOB_QUEUE_REJECT_FRACTION`).
    pub fn fill_fraction(&self) -> f64 {
        let free = self.permits.available_permits();
        1.0 - (free as f64 / self.capacity as f64)
    }

    /// Runs `job` once a permit is free and hands the result straight back
    /// to the caller, for callers that want to drive a disk job inline
    /// rather than pick it up later off the results channel.
    pub async fn run_blocking<F, T>(&self, job: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.permits.clone().acquire_owned().await;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .expect("disk job panicked")
    }

    /// Runs `job` (a blocking closure touching the chunk store) once a
    /// permit is free, delivering its outcome on the results channel.
    pub async fn submit<F>(&self, write_id: WriteId, block: u32, job: F)
    where
        F: FnOnce() -> Status + Send + 'static,
    {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let tx = self.results_tx.clone();
        tokio::task::spawn_blocking(move || {
            let status = job();
            let _permit = permit;
            status
        })
        .await
        .map(|status| JobResult { write_id, block, status })
        .ok()
        .and_then(|result| {
            let _ = tx.try_send(result);
            Some(())
        });
    }
}
