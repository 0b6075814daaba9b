//! Background task runner for refresh jobs
//!
//! A fixed set of workers drains a bounded queue. Submitting never waits: when
//! the queue is full the job is dropped, since a lost refresh only means the
//! entry expires and is reloaded on the next miss.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Job = BoxFuture<'static, ()>;

/// Bounded worker pool.
///
/// Must be created inside a tokio runtime. Workers stop once the runner is
/// dropped and the queue has drained.
pub struct TaskRunner {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskRunner {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            debug!("Refresh worker {} stopping", id);
                            break;
                        };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!("Refresh worker {}: job panicked", id);
                        }
                    }
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Queue `job` for execution. Returns `false` if it was dropped.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tx.try_send(job.boxed()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Refresh queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Refresh queue closed, dropping job");
                false
            }
        }
    }

    /// Jobs waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        // Queued jobs still run; idle workers exit when the channel closes.
        debug!("Task runner dropped with {} pending jobs", self.pending());
    }
}
