//! Bounded worker pool
//!
//! Submitted workers go into an unbounded intake queue. A dispatcher task
//! drains it and gives every job its own waiter, which holds one semaphore
//! permit for the whole run. At most `max_concurrent` transfers run at once;
//! the rest wait in FIFO order on the semaphore.
//!
//! A queued job whose token is cancelled stops waiting immediately and
//! finishes as cancelled without touching the network.

use super::worker::DownloadWorker;
use crate::error::GrabbitError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

#[derive(Debug)]
pub struct WorkerPool {
    intake: mpsc::UnboundedSender<DownloadWorker>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    /// Submitted and not yet finished (queued + running)
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start the dispatcher; must be called inside a tokio runtime
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (intake, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(dispatch(rx, semaphore.clone(), pending.clone()));
        info!("Worker pool started with {} slots", max_concurrent);

        Self {
            intake,
            semaphore,
            max_concurrent,
            pending,
        }
    }

    /// Queue a worker; it runs as soon as a slot frees up
    pub fn submit(&self, worker: DownloadWorker) -> Result<(), GrabbitError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = self.intake.send(worker) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(GrabbitError::PoolClosed(rejected.0.id().to_string()));
        }
        Ok(())
    }

    /// Workers currently holding a slot
    pub fn running(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Workers submitted and not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<DownloadWorker>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(worker) = rx.recv().await {
        let semaphore = semaphore.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            let cancel = worker.cancel_token().clone();
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            if permit.is_some() {
                debug!(task = %worker.id(), "Worker acquired a slot");
            }

            let status = worker.run().await;
            drop(permit);
            pending.fetch_sub(1, Ordering::SeqCst);
            debug!(status = %status, "Worker finished");
        });
    }
    debug!("Worker pool intake closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DuplicateDetector;
    use crate::engine::WorkerContext;
    use crate::history::HistoryLog;
    use crate::registry::TaskRegistry;
    use grabbit_types::{DownloadStatus, DownloadTask};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn cancelled_job_leaves_the_queue_without_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let history = Arc::new(HistoryLog::new());
        let (event_tx, _) = broadcast::channel(16);
        let ctx = WorkerContext {
            client: reqwest::Client::new(),
            registry: registry.clone(),
            history: history.clone(),
            detector: Arc::new(DuplicateDetector::open(dir.path().to_path_buf(), None).await),
            event_tx,
            storage_dir: dir.path().to_path_buf(),
            block_size: 8192,
        };

        let pool = WorkerPool::new(1);
        // Occupy the only slot so the job stays queued
        let _held = pool.semaphore.clone().acquire_owned().await.unwrap();
        assert_eq!(pool.running(), 1);

        let token = CancellationToken::new();
        let task = registry
            .create(
                DownloadTask::new("queued.bin".into(), "http://127.0.0.1:9/queued.bin".into(), None),
                token.clone(),
            )
            .unwrap();
        let url = url::Url::parse(&task.url).unwrap();
        tokio_test::assert_ok!(pool.submit(DownloadWorker::new(&task, url, token.clone(), ctx)));
        assert_eq!(pool.pending(), 1);

        token.cancel();
        for _ in 0..500 {
            if pool.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pool.pending(), 0);
        assert_eq!(registry.get("queued.bin").unwrap().status, DownloadStatus::Cancelled);
        assert_eq!(history.snapshot().len(), 1);
    }
}
