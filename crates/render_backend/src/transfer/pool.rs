//! Fixed-size worker pool for CPU-side upload encoding.
//!
//! Workers pull boxed closures off a shared channel and run them to
//! completion. A batch submission returns a [`BatchFuture`] that blocks
//! until every task in the batch has finished; the task closure is fully
//! consumed (and its captures dropped) before the batch counter decrements,
//! so a completed wait guarantees no worker still holds borrowed source
//! data.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

/// Queue depth per pool; submissions past this block until workers catch up.
const JOB_QUEUE_DEPTH: usize = 128;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    task: Task,
    batch: Arc<BatchState>,
}

struct BatchState {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl BatchState {
    fn complete_one(&self) {
        let mut remaining = self
            .remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }
}

/// Completion handle for one submitted batch of tasks.
pub struct BatchFuture {
    state: Arc<BatchState>,
}

impl BatchFuture {
    /// Blocks until every task in the batch has run.
    pub fn wait(self) {
        let mut remaining = self
            .state
            .remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *remaining > 0 {
            remaining = self
                .state
                .done
                .wait(remaining)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Fixed set of named worker threads fed from one channel.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` threads (clamped to at least one).
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(JOB_QUEUE_DEPTH);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver: Receiver<Job> = receiver.clone();
            let builder = thread::Builder::new().name(format!("transfer-worker-{index}"));
            match builder.spawn(move || worker_loop(receiver)) {
                Ok(handle) => workers.push(handle),
                Err(err) => log::error!("failed to spawn transfer worker {index}: {err}"),
            }
        }
        log::debug!("transfer pool started with {} workers", workers.len());

        WorkerPool {
            sender: Some(sender),
            workers,
        }
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Submits a batch of tasks and returns its completion future.
    ///
    /// An empty batch yields a future whose wait returns immediately. When
    /// no worker thread could be spawned, tasks run inline on the caller.
    pub fn submit(&self, tasks: Vec<Task>) -> BatchFuture {
        let state = Arc::new(BatchState {
            remaining: Mutex::new(tasks.len()),
            done: Condvar::new(),
        });

        if self.workers.is_empty() {
            for task in tasks {
                task();
                state.complete_one();
            }
            return BatchFuture { state };
        }

        if let Some(sender) = &self.sender {
            for task in tasks {
                let job = Job {
                    task,
                    batch: Arc::clone(&state),
                };
                if let Err(err) = sender.send(job) {
                    // Channel gone: workers exited early. Run in place.
                    let job = err.into_inner();
                    (job.task)();
                    job.batch.complete_one();
                }
            }
        }
        BatchFuture { state }
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    // Exits when every sender is dropped.
    while let Ok(job) = receiver.recv() {
        (job.task)();
        job.batch.complete_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("transfer worker panicked during shutdown");
            }
        }
    }
}
