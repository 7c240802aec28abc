//! Analysis worker pool
//!
//! Fixed pool of OS threads for CPU-heavy advisory work (waveform peaks,
//! zero-crossing scans). Tasks are served FIFO; a worker that finishes
//! immediately takes the next queued task.
//!
//! Results come back through a oneshot channel so async callers can await
//! them without blocking the runtime. Nothing on the trigger path waits on
//! this pool.

use crate::error::WorkerError;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Upper bound on worker threads
pub const MAX_WORKERS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    id: u64,
    label: &'static str,
    job: Job,
}

/// Shared state between the pool handle and its workers
struct SharedPoolState {
    /// FIFO task queue
    queue: Mutex<VecDeque<QueuedTask>>,

    /// Wakes idle workers
    condvar: Condvar,

    /// Stop flag for shutdown
    stop_flag: AtomicBool,

    /// Tasks currently executing
    active: AtomicUsize,

    /// Tasks finished (including panicked)
    completed: AtomicU64,
}

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
}

/// Pending result of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    receiver: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the task result
    ///
    /// # Errors
    /// - `TaskDropped` if the task panicked or the pool shut down first
    pub async fn join(self) -> Result<T, WorkerError> {
        let id = self.id;
        self.receiver.await.map_err(|_| WorkerError::TaskDropped(id))
    }

    /// Blocking variant for callers outside the runtime
    pub fn blocking_join(self) -> Result<T, WorkerError> {
        let id = self.id;
        self.receiver
            .blocking_recv()
            .map_err(|_| WorkerError::TaskDropped(id))
    }
}

/// Fixed-size thread pool with a FIFO queue
pub struct WorkerPool {
    state: Arc<SharedPoolState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    worker_count: usize,
}

impl WorkerPool {
    /// Pool sized to available parallelism, clamped to 1..=MAX_WORKERS
    pub fn with_default_size() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers)
    }

    pub fn new(workers: usize) -> Self {
        let worker_count = workers.clamp(1, MAX_WORKERS);
        let state = Arc::new(SharedPoolState {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop_flag: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        });

        let mut threads = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let state_clone = Arc::clone(&state);
            let spawned = thread::Builder::new()
                .name(format!("clipdeck-analysis-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, state_clone));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => error!("Failed to spawn analysis worker {}: {}", worker_id, e),
            }
        }

        info!("Analysis pool started with {} worker threads", threads.len());

        Self {
            state,
            worker_count: threads.len(),
            threads: Mutex::new(threads),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue a task; the result is delivered through the returned handle
    pub fn submit<F, T>(&self, label: &'static str, task: F) -> Result<TaskHandle<T>, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.state.stop_flag.load(Ordering::Acquire) || self.worker_count == 0 {
            return Err(WorkerError::ShuttingDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            // Receiver may be gone; the result is advisory
            let _ = sender.send(task());
        });

        {
            let mut queue = self.state.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(QueuedTask { id, label, job });
        }
        self.state.condvar.notify_one();

        debug!("Queued analysis task {} ({})", id, label);
        Ok(TaskHandle { id, receiver })
    }

    fn worker_loop(worker_id: usize, state: Arc<SharedPoolState>) {
        debug!("Analysis worker {} started", worker_id);

        loop {
            let task = {
                let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                while queue.is_empty() && !state.stop_flag.load(Ordering::Acquire) {
                    queue = state
                        .condvar
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if state.stop_flag.load(Ordering::Acquire) {
                    break;
                }
                queue.pop_front()
            };

            let Some(task) = task else { continue };

            state.active.fetch_add(1, Ordering::AcqRel);
            if catch_unwind(AssertUnwindSafe(task.job)).is_err() {
                warn!(
                    "Analysis task {} ({}) panicked on worker {}",
                    task.id, task.label, worker_id
                );
            }
            state.active.fetch_sub(1, Ordering::AcqRel);
            state.completed.fetch_add(1, Ordering::Relaxed);
        }

        debug!("Analysis worker {} stopped", worker_id);
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.worker_count,
            queued: self
                .state
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            active: self.state.active.load(Ordering::Acquire),
            completed: self.state.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, drop queued tasks and join the workers
    ///
    /// Tasks already running finish first. Idempotent.
    pub fn shutdown(&self) {
        if self.state.stop_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down analysis pool");

        let dropped = {
            let mut queue = self.state.queue.lock().unwrap_or_else(|e| e.into_inner());
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!("Discarded {} queued analysis tasks", dropped);
        }

        self.state.condvar.notify_all();

        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for (idx, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                error!("Analysis worker {} join failed", idx);
            }
        }
        info!("Analysis pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
