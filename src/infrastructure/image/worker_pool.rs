//! Bounded worker pools with a newest-first priority queue.
//!
//! Each pool is a single loop task owning the queue. Jobs are admitted under a
//! semaphore bounding concurrency and run as spawned tasks. Queue slots are
//! reserved at submission, so a full queue rejects the job before it is sent
//! and the submitter learns about it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, trace, warn};

use crate::domain::entities::CommandId;

/// Default number of concurrent pre-resolution jobs.
pub const DEFAULT_PRE_WORKERS: usize = 2;

/// Default number of concurrent downloads.
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

/// Default queue bound of each pool.
pub const DEFAULT_MAX_QUEUED: usize = 256;

type Job = BoxFuture<'static, ()>;

/// What became of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Submission {
    /// The job holds a queue slot and will run unless cancelled.
    Queued,
    /// The queue was full. The job was dropped without running.
    Rejected,
    /// The pool is shut down. The job was dropped without running.
    Closed,
}

impl Submission {
    /// Returns true if the job will run.
    #[must_use]
    pub const fn is_queued(self) -> bool {
        matches!(self, Self::Queued)
    }
}

#[derive(Debug)]
enum PoolCommand {
    Submit(QueuedJob),
    Cancel { id: CommandId },
    Shutdown,
}

struct QueuedJob {
    id: CommandId,
    job: Job,
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap on the sequence id: the most recent command pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    /// Reserved queue slots: jobs in the channel plus jobs in the heap.
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

/// Keeps the running counter right even when a job panics.
struct RunningGuard {
    counters: Arc<PoolCounters>,
}

impl RunningGuard {
    fn enter(counters: Arc<PoolCounters>) -> Self {
        counters.running.fetch_add(1, Ordering::Relaxed);
        Self { counters }
    }

    fn finish(self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// State for the background pool loop.
struct WorkerState {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
    request_rx: mpsc::UnboundedReceiver<PoolCommand>,
}

impl WorkerState {
    fn release_slots(&self, count: usize) {
        if count > 0 {
            self.counters.queued.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

/// A bounded pool executing jobs newest-first.
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    max_queued: usize,
    request_tx: mpsc::UnboundedSender<PoolCommand>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queued", &self.queued())
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts a pool. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(name: &'static str, workers: usize, max_queued: usize) -> Self {
        let workers = workers.max(1);
        let max_queued = max_queued.max(1);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(PoolCounters::default());

        let state = WorkerState {
            name,
            semaphore: Arc::new(Semaphore::new(workers)),
            counters: counters.clone(),
            request_rx,
        };
        tokio::spawn(Self::run_worker_loop(state));
        debug!(pool = name, workers, max_queued, "Worker pool started");

        Self {
            name,
            workers,
            max_queued,
            request_tx,
            counters,
        }
    }

    async fn run_worker_loop(mut state: WorkerState) {
        let mut queue: BinaryHeap<QueuedJob> = BinaryHeap::new();

        loop {
            tokio::select! {
                cmd = state.request_rx.recv() => {
                    match cmd {
                        Some(PoolCommand::Submit(job)) => queue.push(job),
                        Some(PoolCommand::Cancel { id }) => {
                            let before = queue.len();
                            queue.retain(|job| job.id != id);
                            state.release_slots(before - queue.len());
                        }
                        Some(PoolCommand::Shutdown) | None => break,
                    }
                }
                Ok(permit) = state.semaphore.clone().acquire_owned(), if !queue.is_empty() => {
                    if let Some(QueuedJob { id, job }) = queue.pop() {
                        state.release_slots(1);
                        let running = RunningGuard::enter(state.counters.clone());
                        trace!(pool = state.name, id = %id, "Running command");
                        tokio::spawn(async move {
                            job.await;
                            running.finish();
                            drop(permit);
                        });
                    }
                }
            }
        }

        state.request_rx.close();
        state.counters.queued.store(0, Ordering::Relaxed);
        debug!(pool = state.name, dropped = queue.len(), "Worker pool stopped");
    }

    /// Queues a job if a queue slot is free. A job that is not queued is
    /// dropped before returning.
    pub fn submit<F>(&self, id: CommandId, job: F) -> Submission
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let reserved = self
            .counters
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < self.max_queued).then_some(queued + 1)
            });
        if reserved.is_err() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(pool = self.name, id = %id, "Pool saturated, rejecting command");
            return Submission::Rejected;
        }

        let job = QueuedJob {
            id,
            job: job.boxed(),
        };
        if self.request_tx.send(PoolCommand::Submit(job)).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            return Submission::Closed;
        }
        Submission::Queued
    }

    /// Removes a queued job. A job already running is not affected.
    pub fn cancel(&self, id: CommandId) {
        let _ = self.request_tx.send(PoolCommand::Cancel { id });
    }

    /// Stops the loop. Queued jobs are dropped, running jobs finish.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(PoolCommand::Shutdown);
    }

    /// Pool name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Jobs waiting in the queue, including those not yet picked up by the
    /// pool loop.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Relaxed)
    }

    /// Jobs currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::Relaxed)
    }

    /// Jobs that ran to completion.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Jobs rejected because the queue was full.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }
}

/// The two pools of the image engine plus the shared command sequence.
#[derive(Debug)]
pub struct Scheduler {
    pre: WorkerPool,
    download: WorkerPool,
    sequence: AtomicU64,
}

impl Scheduler {
    /// Starts both pools. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(pre_workers: usize, download_workers: usize, max_queued: usize) -> Self {
        Self {
            pre: WorkerPool::new("pre-resolution", pre_workers, max_queued),
            download: WorkerPool::new("download", download_workers, max_queued),
            sequence: AtomicU64::new(0),
        }
    }

    /// Starts both pools with default sizes.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_PRE_WORKERS, DEFAULT_DOWNLOAD_WORKERS, DEFAULT_MAX_QUEUED)
    }

    /// Allocates the next command id. Ids are unique across every engine
    /// sharing this scheduler.
    pub fn next_id(&self) -> CommandId {
        CommandId::new(self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The pre-resolution pool.
    #[must_use]
    pub const fn pre(&self) -> &WorkerPool {
        &self.pre
    }

    /// The download pool.
    #[must_use]
    pub const fn download(&self) -> &WorkerPool {
        &self.download
    }

    /// Removes `id` from both queues.
    pub fn cancel(&self, id: CommandId) {
        self.pre.cancel(id);
        self.download.cancel(id);
    }

    /// Stops both pools.
    pub fn shutdown(&self) {
        self.pre.shutdown();
        self.download.shutdown();
    }
}
