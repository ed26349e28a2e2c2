use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use tracing::{debug, error, trace, warn};

use crate::exec::{Executor, SystemExecutor};
use crate::request::AsyncRequest;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix; workers are named `<prefix>-<id>`.
    pub thread_name: String,
    /// Stack size for worker threads. Default: the platform default.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_name: "agentlink-worker".to_string(),
            stack_size: None,
        }
    }
}

/// A worker parked on its one-shot handoff channel.
struct IdleWorker {
    id: usize,
    handoff: SyncSender<AsyncRequest>,
}

struct Shared {
    idle: Mutex<VecDeque<IdleWorker>>,
    live: AtomicUsize,
    next_id: AtomicUsize,
    executor: Arc<dyn Executor>,
    config: PoolConfig,
}

impl Shared {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleWorker>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dispatcher that runs blocking calls on recycled worker threads.
///
/// Cloning is cheap and yields another handle to the same pool. A process
/// normally creates one pool at start-up and shares it. Workers are never
/// torn down while any handle is alive; once the last handle is dropped,
/// idle workers see their handoff channel close and exit.
///
/// The pool enforces no cap on live threads: it grows to the peak number
/// of concurrently in-flight requests, so callers bound concurrency.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool that executes requests with the platform's syscalls.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_executor(config, SystemExecutor)
    }

    /// Create a pool with a custom executor.
    pub fn with_executor(config: PoolConfig, executor: impl Executor) -> Self {
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                executor: Arc::new(executor),
                config,
            }),
        }
    }

    /// Submit a request.
    ///
    /// Never blocks beyond the idle-list lock. The request is handed to an
    /// idle worker if there is one, otherwise a new worker is spawned for
    /// it. If the thread cannot be created the request fails with the spawn
    /// error and its completion is posted from the calling thread.
    pub fn submit(&self, req: AsyncRequest) {
        debug!(kind = ?req.kind(), token = ?req.token(), "async request posted");

        let mut idle = self.shared.lock_idle();
        let mut req = req;
        while let Some(worker) = idle.pop_front() {
            match worker.handoff.try_send(req) {
                Ok(()) => {
                    trace!(worker = worker.id, "request handed to idle worker");
                    return;
                }
                Err(TrySendError::Full(back)) | Err(TrySendError::Disconnected(back)) => {
                    warn!(worker = worker.id, "idle worker unreachable; discarding it");
                    self.shared.live.fetch_sub(1, Ordering::SeqCst);
                    req = back;
                }
            }
        }
        self.spawn_worker(req);
        drop(idle);
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Number of workers currently parked waiting for a request.
    pub fn idle_count(&self) -> usize {
        self.shared.lock_idle().len()
    }

    // Called with the idle lock held, so a worker finishing concurrently
    // cannot slip onto the idle list between the check and the spawn.
    fn spawn_worker(&self, mut req: AsyncRequest) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (handoff, rx) = mpsc::sync_channel(1);
        let executor = Arc::clone(&self.shared.executor);
        let pool = Arc::downgrade(&self.shared);

        let mut builder =
            thread::Builder::new().name(format!("{}-{id}", self.shared.config.thread_name));
        if let Some(size) = self.shared.config.stack_size {
            builder = builder.stack_size(size);
        }

        match builder.spawn(move || worker_main(id, executor, pool, rx)) {
            Ok(_detached) => {
                self.shared.live.fetch_add(1, Ordering::SeqCst);
                debug!(worker = id, "worker thread created");
                if let Err(mpsc::SendError(back)) = handoff.send(req) {
                    // The worker exits only after its handoff closes; a closed
                    // receiver here means the thread died during start-up.
                    self.shared.live.fetch_sub(1, Ordering::SeqCst);
                    let mut back = back;
                    back.fail(libc::EAGAIN);
                    back.complete();
                }
            }
            Err(err) => {
                error!(error = %err, "can't create a worker thread");
                req.fail(err.raw_os_error().unwrap_or(libc::EAGAIN));
                req.complete();
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("idle", &self.idle_count())
            .finish()
    }
}

fn worker_main(
    id: usize,
    executor: Arc<dyn Executor>,
    pool: Weak<Shared>,
    mut handoff: Receiver<AsyncRequest>,
) {
    while let Ok(mut req) = handoff.recv() {
        run(executor.as_ref(), &mut req);
        debug!(
            worker = id,
            kind = ?req.kind(),
            token = ?req.token(),
            error = req.error(),
            "async request complete"
        );

        let Some(shared) = pool.upgrade() else {
            req.complete();
            break;
        };

        let (tx, rx) = mpsc::sync_channel(1);
        {
            let mut idle = shared.lock_idle();
            // Posting inside the lock keeps a racing submit from spawning a
            // new thread while this one is about to become idle.
            req.complete();
            idle.push_back(IdleWorker { id, handoff: tx });
        }
        handoff = rx;
    }

    if let Some(shared) = pool.upgrade() {
        shared.live.fetch_sub(1, Ordering::SeqCst);
    }
    trace!(worker = id, "worker thread exiting");
}

fn run(executor: &dyn Executor, req: &mut AsyncRequest) {
    let kind = req.kind();
    if !executor.supports(kind) {
        req.reject_unsupported();
        return;
    }
    let outcome = executor.execute(req.operation_mut());
    req.set_outcome(outcome);
}
