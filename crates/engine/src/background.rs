//! Background job workers
//!
//! Training runs (with the publish and reload notification that follow
//! them) and artifact reloads are long or blocking, so the engine pushes
//! them onto a small fixed pool instead of running them on the caller's
//! thread. Jobs are ordered by [`JobPriority`], FIFO within a
//! priority, and the queue is bounded: a full queue rejects new work with
//! [`QueueFull`] instead of growing without limit.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;

use latent_core::{LatentError, LatentResult};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error};

/// Scheduling order of background jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    /// Full retrain and publish
    Training = 0,
    /// Adopting a newer artifact from disk
    Reload = 1,
}

/// The job queue is at capacity or the workers are stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("background queue is full or stopped")]
pub struct QueueFull;

/// Queue counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs waiting to run
    pub queued: usize,
    /// Jobs running now
    pub running: usize,
    /// Jobs finished, including ones that panicked
    pub finished: u64,
    /// Jobs that panicked
    pub panicked: u64,
    /// Worker threads
    pub workers: usize,
}

struct Job {
    priority: JobPriority,
    seq: u64,
    name: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

// max-heap: higher priority, then older sequence
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    jobs: Mutex<BinaryHeap<Job>>,
    wake: Condvar,
    idle: Condvar,
    stopping: AtomicBool,
    next_seq: AtomicU64,
    queued: AtomicUsize,
    running: AtomicUsize,
    finished: AtomicU64,
    panicked: AtomicU64,
    capacity: usize,
}

/// Fixed pool of named worker threads draining a priority queue
pub struct BackgroundWorkers {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl std::fmt::Debug for BackgroundWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorkers")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BackgroundWorkers {
    /// Start `workers` threads (`latent-bg-0`, `latent-bg-1`, ...) sharing
    /// a queue of at most `capacity` pending jobs.
    pub fn new(workers: usize, capacity: usize) -> LatentResult<Self> {
        if workers == 0 || capacity == 0 {
            return Err(LatentError::invalid_input(
                "background workers and queue capacity must be positive",
            ));
        }
        let shared = Arc::new(Shared {
            jobs: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            idle: Condvar::new(),
            stopping: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            finished: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            capacity,
        });

        let pool = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(workers)),
            workers,
        };
        for i in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("latent-bg-{}", i))
                .spawn(move || run_worker(&shared));
            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(LatentError::internal(format!(
                        "failed to spawn background worker: {}",
                        e
                    )));
                }
            }
        }
        Ok(pool)
    }

    /// Queue a job. Rejected when the queue is full or after shutdown.
    pub fn submit(
        &self,
        priority: JobPriority,
        name: &'static str,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<(), QueueFull> {
        if self.shared.stopping.load(AtomicOrdering::Acquire) {
            return Err(QueueFull);
        }
        {
            let mut jobs = self.shared.jobs.lock();
            if jobs.len() >= self.shared.capacity {
                return Err(QueueFull);
            }
            jobs.push(Job {
                priority,
                seq: self.shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
                name,
                run: Box::new(run),
            });
            self.shared.queued.fetch_add(1, AtomicOrdering::Release);
        }
        debug!(target: "latent::background", job = name, ?priority, "Job queued");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and no job is running.
    ///
    /// Workers stay alive afterwards.
    pub fn wait_idle(&self) {
        let mut jobs = self.shared.jobs.lock();
        while !jobs.is_empty() || self.shared.running.load(AtomicOrdering::Acquire) > 0 {
            self.shared.idle.wait(&mut jobs);
        }
    }

    /// Stop accepting jobs, run what is queued, and join the workers.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, AtomicOrdering::Release);
        {
            // Holding the queue lock orders this wakeup after any worker's
            // stopping check, so none can sleep through it.
            let _jobs = self.shared.jobs.lock();
            self.shared.wake.notify_all();
        }
        let me = std::thread::current().id();
        for handle in self.handles.lock().drain(..) {
            // A job may drop the last owner of the pool; never join ourselves.
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    /// Counters snapshot
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queued: self.shared.queued.load(AtomicOrdering::Relaxed),
            running: self.shared.running.load(AtomicOrdering::Relaxed),
            finished: self.shared.finished.load(AtomicOrdering::Relaxed),
            panicked: self.shared.panicked.load(AtomicOrdering::Relaxed),
            workers: self.workers,
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Marks a job finished on drop, so a panicking job still releases
/// `wait_idle` callers.
struct RunningJob<'a> {
    shared: &'a Shared,
}

impl Drop for RunningJob<'_> {
    fn drop(&mut self) {
        let was_running = self.shared.running.fetch_sub(1, AtomicOrdering::AcqRel);
        self.shared.finished.fetch_add(1, AtomicOrdering::Relaxed);
        let jobs = self.shared.jobs.lock();
        if was_running == 1 && jobs.is_empty() {
            self.shared.idle.notify_all();
        }
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock();
            loop {
                if let Some(job) = jobs.pop() {
                    shared.queued.fetch_sub(1, AtomicOrdering::Release);
                    shared.running.fetch_add(1, AtomicOrdering::Release);
                    break job;
                }
                if shared.stopping.load(AtomicOrdering::Acquire) {
                    return;
                }
                shared.wake.wait(&mut jobs);
            }
        };

        let _running = RunningJob { shared };
        let name = job.name;
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job.run)) {
            shared.panicked.fetch_add(1, AtomicOrdering::Relaxed);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            error!(target: "latent::background", job = name, %message, "Background job panicked");
        }
    }
}
