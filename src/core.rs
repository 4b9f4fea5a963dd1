//! Core business logic - the operation coordinator
//!
//! `Coordinator` is what a front end talks to. It owns:
//! - the `OperationQueue` (and through it the worker thread, the package cache,
//!   and the selection reconciler)
//! - the last package list delivered by a refresh
//! - the last reconciled `SelectionView`
//! - the `ProgressLog` the worker writes into
//!
//! State machine: `Idle -> Refreshing -> Idle` and
//! `Idle -> Installing -> Refreshing -> Idle`. Everything except polling and
//! reading is rejected with `CoordinatorError::Busy` outside `Idle`.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cache::PackageCache;
use crate::error::{CacheError, CoordinatorError, OperationFailure};
use crate::progress::{ProgressEvent, ProgressLog};
use crate::types::{Activity, PackageRecord, SelectionView};
use crate::worker::{Completion, Operation, OperationId, OperationQueue, Outcome, SelectionRequest};

/// Front-end callbacks. All are invoked on the thread that calls `poll`.
pub trait Observer {
    fn packages_changed(&mut self, _packages: &[PackageRecord]) {}
    fn activity_changed(&mut self, _activity: Activity) {}
    fn selection_changed(&mut self, _view: &SelectionView) {}
    fn operation_failed(&mut self, _failure: &OperationFailure) {}
}

/// Observer that ignores everything
pub struct NullObserver;

impl Observer for NullObserver {}

pub struct Coordinator {
    queue: OperationQueue,
    /// Completion handlers still owed a result
    pending: HashMap<OperationId, Operation>,
    activity: Activity,
    packages: Vec<PackageRecord>,
    selection: SelectionView,
    log: ProgressLog,
    observer: Box<dyn Observer>,
}

impl Coordinator {
    /// Start the worker. `open` builds the package cache on the worker thread.
    pub fn spawn<C, F>(
        open: F,
        log: ProgressLog,
        observer: Box<dyn Observer>,
    ) -> Result<Self, CoordinatorError>
    where
        C: PackageCache + 'static,
        F: FnOnce() -> Result<C, CacheError> + Send + 'static,
    {
        let queue = OperationQueue::spawn(open, log.clone())?;
        Ok(Self {
            queue,
            pending: HashMap::new(),
            activity: Activity::Idle,
            packages: Vec::new(),
            selection: SelectionView::default(),
            log,
            observer,
        })
    }

    // === Accessors ===

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    pub fn packages(&self) -> &[PackageRecord] {
        &self.packages
    }

    pub fn selection(&self) -> &SelectionView {
        &self.selection
    }

    /// Look up one package from the last refresh
    pub fn describe(&self, name: &str) -> Option<&PackageRecord> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Progress lines appended since the last drain. If the buffer overflowed
    /// in between, the first line says how many were lost.
    pub fn drain_log(&self) -> Vec<String> {
        let (events, dropped) = self.log.drain_counted();
        let mut lines = Vec::with_capacity(events.len() + 1);
        if dropped > 0 {
            lines.push(format!("({dropped} earlier progress line(s) dropped)"));
        }
        lines.extend(events.iter().map(ToString::to_string));
        lines
    }

    /// Structured form of `drain_log`
    pub fn drain_events(&self) -> Vec<ProgressEvent> {
        self.log.drain()
    }

    // === Long-running operations ===

    /// Reload package lists in the background
    pub fn refresh(&mut self) -> Result<OperationId, CoordinatorError> {
        self.ensure_idle()?;
        self.start_refresh()
    }

    /// Install the resolved change set in the background.
    /// Fails with `NothingSelected` without queueing anything if the set is empty.
    pub fn commit(&mut self) -> Result<OperationId, CoordinatorError> {
        self.ensure_idle()?;
        if self.selection.is_empty() {
            info!("commit requested with nothing selected");
            return Err(CoordinatorError::NothingSelected);
        }

        let id = self.queue.submit(Operation::InstallSelected)?;
        self.pending.insert(id, Operation::InstallSelected);
        self.set_activity(Activity::Installing);
        info!(%id, packages = self.selection.change_set.len(), "install queued");
        Ok(id)
    }

    fn start_refresh(&mut self) -> Result<OperationId, CoordinatorError> {
        self.clear_selection_state();
        let id = self.queue.submit(Operation::RefreshPackages)?;
        self.pending.insert(id, Operation::RefreshPackages);
        self.set_activity(Activity::Refreshing);
        Ok(id)
    }

    // === Selection ===

    /// Check or uncheck one package and reconcile against the solver
    pub fn apply_toggle(
        &mut self,
        name: &str,
        selected: bool,
    ) -> Result<&SelectionView, CoordinatorError> {
        self.select(SelectionRequest::Toggle {
            name: name.to_string(),
            selected,
        })
    }

    pub fn select_all(&mut self) -> Result<&SelectionView, CoordinatorError> {
        self.select(SelectionRequest::SelectAll)
    }

    pub fn clear_selection(&mut self) -> Result<&SelectionView, CoordinatorError> {
        self.select(SelectionRequest::Clear)
    }

    fn select(&mut self, request: SelectionRequest) -> Result<&SelectionView, CoordinatorError> {
        // While idle the worker has nothing in flight, so this round trip only
        // waits for in-memory mark and resolve work.
        self.ensure_idle()?;
        let view = self.queue.select(request)?;
        if !view.demoted.is_empty() {
            warn!(packages = ?view.demoted, "selections dropped by dependency conflicts");
        }
        self.selection = view;
        self.observer.selection_changed(&self.selection);
        Ok(&self.selection)
    }

    fn clear_selection_state(&mut self) {
        if self.selection == SelectionView::default() {
            return;
        }
        self.selection = SelectionView::default();
        self.observer.selection_changed(&self.selection);
    }

    // === Completion delivery ===

    /// Dispatch every completion that is ready. Returns how many were handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(done) = self.queue.try_completion() {
            self.dispatch(done);
            handled += 1;
        }
        if handled == 0 {
            self.reap_lost_operations();
        }
        handled
    }

    /// Wait up to `timeout` for one completion, then dispatch anything else ready
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        match self.queue.completion_timeout(timeout) {
            Some(done) => {
                self.dispatch(done);
                1 + self.poll()
            }
            None => self.poll(),
        }
    }

    /// If the worker thread died, nothing it still owed will ever arrive.
    /// Fail those operations so the coordinator can leave its busy state.
    fn reap_lost_operations(&mut self) {
        if self.pending.is_empty() || self.queue.is_running() {
            return;
        }
        // Anything sent just before the thread exited is still in the channel
        while let Some(done) = self.queue.try_completion() {
            self.dispatch(done);
        }

        let mut lost: Vec<(OperationId, Operation)> = self.pending.drain().collect();
        lost.sort_unstable_by_key(|(id, _)| *id);
        for (id, operation) in lost {
            error!(%id, %operation, "package worker exited before completing operation");
            self.report(OperationFailure {
                operation,
                error: CacheError::WorkerExited,
            });
        }
        self.clear_selection_state();
        self.set_activity(Activity::Idle);
    }

    fn dispatch(&mut self, done: Completion) {
        let Some(operation) = self.pending.remove(&done.id) else {
            warn!(id = %done.id, "completion for unknown operation");
            return;
        };
        debug!(id = %done.id, %operation, elapsed = ?done.elapsed, "dispatching completion");

        match (operation, done.result) {
            (Operation::RefreshPackages, Ok(Outcome::Refreshed(records))) => {
                info!(upgradable = records.len(), "refresh complete");
                self.packages = records;
                self.clear_selection_state();
                self.observer.packages_changed(&self.packages);
                self.set_activity(Activity::Idle);
            }
            (Operation::InstallSelected, Ok(Outcome::Installed(changes))) => {
                info!(installed = changes.len(), "install complete");
                self.after_install();
            }
            (Operation::InstallSelected, Err(error)) => {
                self.report(OperationFailure { operation, error });
                self.after_install();
            }
            (Operation::RefreshPackages, Err(error)) => {
                self.report(OperationFailure { operation, error });
                self.set_activity(Activity::Idle);
            }
            (operation, Ok(outcome)) => {
                error!(%operation, ?outcome, "mismatched completion");
                self.set_activity(Activity::Idle);
            }
        }
    }

    /// Package lists are stale after an install attempt; always re-derive them
    fn after_install(&mut self) {
        self.clear_selection_state();
        if let Err(e) = self.start_refresh() {
            error!(error = %e, "could not queue post-install refresh");
            self.set_activity(Activity::Idle);
        }
    }

    fn report(&mut self, failure: OperationFailure) {
        error!(%failure, "operation failed");
        self.observer.operation_failed(&failure);
    }

    fn set_activity(&mut self, activity: Activity) {
        if self.activity != activity {
            debug!(from = %self.activity, to = %activity, "activity");
            self.activity = activity;
            self.observer.activity_changed(activity);
        }
    }

    fn ensure_idle(&self) -> Result<(), CoordinatorError> {
        if self.activity.is_busy() {
            return Err(CoordinatorError::Busy(self.activity));
        }
        Ok(())
    }

    // === Lifecycle ===

    /// Stop the worker after whatever is queued has run, delivering every
    /// completion it produced.
    pub fn shutdown(mut self) {
        let leftover = self.queue.shutdown();
        for done in leftover {
            self.dispatch(done);
        }
        info!("coordinator shut down");
    }
}
