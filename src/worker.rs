//! Single background worker that owns the package cache.
//!
//! All cache access goes through one FIFO job channel consumed by one thread, so
//! operations never interleave and complete in submission order. Completions come
//! back on a second channel which the control side polls.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cache::PackageCache;
use crate::error::{CacheError, CoordinatorError};
use crate::progress::{ProgressLog, ProgressSink};
use crate::reconcile::SelectionReconciler;
use crate::types::{ChangeSet, PackageRecord, SelectionView};

/// Identifies one submitted operation and its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Long-running operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    RefreshPackages,
    InstallSelected,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshPackages => write!(f, "Refresh"),
            Self::InstallSelected => write!(f, "Install"),
        }
    }
}

/// Cheap, in-memory selection edits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionRequest {
    Toggle { name: String, selected: bool },
    SelectAll,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Upgradable packages after the refresh
    Refreshed(Vec<PackageRecord>),
    /// Packages that were changed
    Installed(ChangeSet),
}

#[derive(Debug)]
pub struct Completion {
    pub id: OperationId,
    pub operation: Operation,
    pub result: Result<Outcome, CacheError>,
    pub elapsed: Duration,
}

enum Job {
    Run {
        id: OperationId,
        operation: Operation,
    },
    Select {
        request: SelectionRequest,
        reply: Sender<Result<SelectionView, CacheError>>,
    },
    Shutdown,
}

// ============================================================================
// Queue (control side)
// ============================================================================

pub struct OperationQueue {
    jobs: Sender<Job>,
    completions: Receiver<Completion>,
    handle: Option<JoinHandle<()>>,
    next_id: u64,
}

impl OperationQueue {
    /// Start the worker thread. `open` runs on that thread and builds the cache
    /// it will own; if it fails the thread exits and the error is returned here.
    pub fn spawn<C, F>(open: F, log: ProgressLog) -> Result<Self, CacheError>
    where
        C: PackageCache + 'static,
        F: FnOnce() -> Result<C, CacheError> + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = mpsc::channel::<Completion>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CacheError>>();

        let handle = thread::Builder::new()
            .name("package-worker".into())
            .spawn(move || {
                let cache = match open() {
                    Ok(cache) => cache,
                    Err(e) => {
                        error!(error = %e, "failed to open package cache");
                        drop(ready_tx.send(Err(e)));
                        return;
                    }
                };
                drop(ready_tx.send(Ok(())));
                Worker::new(cache, ProgressSink::new(log)).run(&job_rx, &done_tx);
            })
            .map_err(|e| CacheError::Open(format!("failed to start worker thread: {e}")))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(CacheError::Panicked("worker died during startup".into())));
        if let Err(e) = ready {
            drop(handle.join());
            return Err(e);
        }

        info!("package worker started");
        Ok(Self {
            jobs: job_tx,
            completions: done_rx,
            handle: Some(handle),
            next_id: 0,
        })
    }

    /// Queue an operation. Its completion carries the returned id.
    pub fn submit(&mut self, operation: Operation) -> Result<OperationId, CoordinatorError> {
        self.next_id += 1;
        let id = OperationId(self.next_id);
        self.jobs
            .send(Job::Run { id, operation })
            .map_err(|_| CoordinatorError::WorkerGone)?;
        debug!(%id, %operation, "operation queued");
        Ok(id)
    }

    /// Run a selection edit on the worker and wait for the reconciled view.
    /// Waits behind anything already queued.
    pub fn select(&self, request: SelectionRequest) -> Result<SelectionView, CoordinatorError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.jobs
            .send(Job::Select {
                request,
                reply: reply_tx,
            })
            .map_err(|_| CoordinatorError::WorkerGone)?;
        let view = reply_rx.recv().map_err(|_| CoordinatorError::WorkerGone)??;
        Ok(view)
    }

    pub fn try_completion(&self) -> Option<Completion> {
        match self.completions.try_recv() {
            Ok(done) => Some(done),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn completion_timeout(&self, timeout: Duration) -> Option<Completion> {
        match self.completions.recv_timeout(timeout) {
            Ok(done) => Some(done),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop accepting work, wait for the worker loop to exit, and return every
    /// completion it produced that nobody has collected yet.
    pub fn shutdown(&mut self) -> Vec<Completion> {
        let Some(handle) = self.handle.take() else {
            return Vec::new();
        };

        if self.jobs.send(Job::Shutdown).is_err() {
            debug!("worker already gone at shutdown");
        }
        if handle.join().is_err() {
            error!("package worker panicked outside an operation");
        }
        info!("package worker stopped");

        self.completions.try_iter().collect()
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        let leftover = self.shutdown();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "dropping undelivered completions");
        }
    }
}

// ============================================================================
// Worker (background side)
// ============================================================================

struct Worker<C> {
    cache: C,
    reconciler: SelectionReconciler,
    sink: ProgressSink,
}

impl<C: PackageCache> Worker<C> {
    fn new(cache: C, sink: ProgressSink) -> Self {
        Self {
            cache,
            reconciler: SelectionReconciler::new(),
            sink,
        }
    }

    fn run(mut self, jobs: &Receiver<Job>, completions: &Sender<Completion>) {
        while let Ok(job) = jobs.recv() {
            match job {
                Job::Shutdown => {
                    debug!("shutdown requested");
                    break;
                }
                Job::Run { id, operation } => {
                    info!(%id, %operation, "operation started");
                    let started = Instant::now();
                    let result = self.guarded(|w| w.execute(operation));
                    let elapsed = started.elapsed();
                    match &result {
                        Ok(_) => info!(%id, %operation, ?elapsed, "operation finished"),
                        Err(e) => error!(%id, %operation, error = %e, "operation failed"),
                    }
                    let done = Completion {
                        id,
                        operation,
                        result,
                        elapsed,
                    };
                    if completions.send(done).is_err() {
                        warn!("completion receiver gone; stopping worker");
                        break;
                    }
                }
                Job::Select { request, reply } => {
                    let result = self.guarded(|w| w.select(request));
                    if reply.send(result).is_err() {
                        debug!("selection reply dropped");
                    }
                }
            }
        }
    }

    /// Panics in the cache library become errors; the loop keeps going
    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(CacheError::Panicked(msg))
            }
        }
    }

    fn execute(&mut self, operation: Operation) -> Result<Outcome, CacheError> {
        match operation {
            Operation::RefreshPackages => {
                self.reconciler.reset(&mut self.cache);
                let records: Vec<PackageRecord> = self
                    .cache
                    .refresh(&self.sink)?
                    .into_iter()
                    .filter(PackageRecord::is_upgradable)
                    .collect();
                self.reconciler
                    .set_known(records.iter().map(|r| r.name.clone()).collect());
                Ok(Outcome::Refreshed(records))
            }
            Operation::InstallSelected => {
                let changes = self.cache.resolved_changes();
                if changes.is_empty() {
                    return Ok(Outcome::Installed(changes));
                }
                let result = self.cache.commit(&self.sink);
                self.reconciler.reset(&mut self.cache);
                result.map(|()| Outcome::Installed(changes))
            }
        }
    }

    fn select(&mut self, request: SelectionRequest) -> Result<SelectionView, CacheError> {
        match request {
            SelectionRequest::Toggle { name, selected } => {
                debug!(package = %name, selected, "toggle");
                self.reconciler.toggle(&mut self.cache, &name, selected)
            }
            SelectionRequest::SelectAll => Ok(self.reconciler.select_all(&mut self.cache)),
            SelectionRequest::Clear => Ok(self.reconciler.clear(&mut self.cache)),
        }
    }
}
