//! Bounded fan-out of independent jobs over a fixed set of worker tasks.
//!
//! Every submitted job comes back exactly once, either on the results
//! stream with its output or on the errors stream with its error. Both
//! streams close once the last worker finishes.

use crate::error::JobPanic;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Hard ceiling on concurrent workers, whatever the caller asks for.
pub const MAX_CONCURRENCY: usize = 50;

/// A unit of work that keeps its own identity: the pool hands the job back
/// alongside whatever it produced.
#[async_trait]
pub trait Job: Send + 'static {
    type Output: Send + 'static;
    type Error: From<JobPanic> + Send + 'static;

    async fn run(&mut self) -> Result<Self::Output, Self::Error>;
}

pub struct WorkerPool<J: Job> {
    queue: VecDeque<J>,
}

impl<J: Job> Default for WorkerPool<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Job> WorkerPool<J> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn submit(&mut self, job: J) {
        self.queue.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of workers `run` starts for `jobs` queued jobs.
    pub fn worker_count(jobs: usize, concurrency: usize) -> usize {
        if jobs == 0 {
            return 0;
        }
        concurrency.clamp(1, MAX_CONCURRENCY).min(jobs)
    }

    /// Starts the workers on the current runtime. Must be called from
    /// within a tokio runtime.
    pub fn run(self, concurrency: usize) -> PoolRun<J> {
        let workers = Self::worker_count(self.queue.len(), concurrency);
        debug!(jobs = self.queue.len(), workers, "starting worker pool");

        let queue = Arc::new(Mutex::new(self.queue));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();

        for _ in 0..workers {
            let queue = queue.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            set.spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some(mut job) = next else { break };
                    let outcome = AssertUnwindSafe(job.run()).catch_unwind().await;
                    match outcome {
                        Ok(Ok(output)) => {
                            let _ = result_tx.send((job, output));
                        }
                        Ok(Err(err)) => {
                            let _ = error_tx.send((job, err));
                        }
                        Err(panic) => {
                            let panic = JobPanic {
                                message: panic_message(panic.as_ref()),
                            };
                            warn!(error = %panic, "job panicked");
                            let _ = error_tx.send((job, J::Error::from(panic)));
                        }
                    }
                }
            });
        }

        PoolRun {
            results: UnboundedReceiverStream::new(result_rx),
            errors: UnboundedReceiverStream::new(error_rx),
            workers: set,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handles on a running pool.
pub struct PoolRun<J: Job> {
    pub results: UnboundedReceiverStream<(J, J::Output)>,
    pub errors: UnboundedReceiverStream<(J, J::Error)>,
    workers: JoinSet<()>,
}

/// Everything a pool produced.
pub struct PoolOutcome<J: Job> {
    pub results: Vec<(J, J::Output)>,
    pub errors: Vec<(J, J::Error)>,
}

impl<J: Job> PoolRun<J> {
    /// Waits for every worker to exit.
    pub async fn join(mut self) {
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                warn!(error = %err, "worker task failed");
            }
        }
    }

    /// Drains both streams, then joins the workers.
    pub async fn drain(mut self) -> PoolOutcome<J> {
        use futures::StreamExt;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut results_open = true;
        let mut errors_open = true;
        while results_open || errors_open {
            tokio::select! {
                item = self.results.next(), if results_open => match item {
                    Some(item) => results.push(item),
                    None => results_open = false,
                },
                item = self.errors.next(), if errors_open => match item {
                    Some(item) => errors.push(item),
                    None => errors_open = false,
                },
            }
        }
        self.join().await;
        PoolOutcome { results, errors }
    }
}
