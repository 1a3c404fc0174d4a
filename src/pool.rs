use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::trace;

use crate::config::PoolConfig;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bounded handler pool: a handoff queue served by workers that exit after an
/// idle period, with a hard cap on concurrent workers. An enqueue that finds
/// no idle worker spawns a fresh one, so concurrency is bounded by worker
/// count rather than queue depth.
pub struct WorkerPool {
    config: PoolConfig,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: AtomicU32,
    idle: AtomicU32,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Arc<WorkerPool> {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        Arc::new(WorkerPool {
            config,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            workers: AtomicU32::new(0),
            idle: AtomicU32::new(0),
        })
    }

    pub fn worker_count(&self) -> u32 {
        self.workers.load(Ordering::SeqCst)
    }

    /// Run a job on the pool. The reader loop calls this and never blocks on
    /// handler execution.
    pub fn spawn(self: &Arc<Self>, job: impl Future<Output = ()> + Send + 'static) {
        let job: Job = Box::pin(job);

        if self.idle.load(Ordering::SeqCst) > 0 {
            match self.queue_tx.try_send(job) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(job))
                | Err(mpsc::error::TrySendError::Closed(job)) => {
                    self.spawn_worker(job);
                }
            }
            return;
        }
        self.spawn_worker(job);
    }

    fn spawn_worker(self: &Arc<Self>, job: Job) {
        let pool = self.clone();
        tokio::spawn(async move { pool.worker(job).await });
    }

    async fn worker(self: Arc<Self>, first: Job) {
        first.await;

        // join the pool unless the cap is reached; over the cap the task ends
        // after its single job
        loop {
            let count = self.workers.load(Ordering::SeqCst);
            if count >= self.config.max_workers {
                return;
            }
            if self
                .workers
                .compare_exchange(count, count + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        trace!("worker joined the pool ({} workers)", self.worker_count());

        loop {
            self.idle.fetch_add(1, Ordering::SeqCst);
            let job = {
                let mut rx = self.queue_rx.lock().await;
                match timeout(self.config.idle_timeout, rx.recv()).await {
                    Ok(job) => job,
                    // drain a job that raced the idle timeout
                    Err(_) => rx.try_recv().ok(),
                }
            };
            self.idle.fetch_sub(1, Ordering::SeqCst);

            match job {
                Some(job) => job.await,
                None => break,
            }
        }

        self.workers.fetch_sub(1, Ordering::SeqCst);
        trace!("idle worker exited ({} workers)", self.worker_count());
    }
}
