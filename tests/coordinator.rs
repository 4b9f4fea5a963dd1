//! End-to-end coordinator behaviour against the in-memory package database

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aptup::cache::{Journal, MemoryCache, MemoryPackage, PackageCache};
use aptup::core::{Coordinator, NullObserver, Observer};
use aptup::error::{CacheError, CoordinatorError, OperationFailure};
use aptup::progress::{Phase, ProgressEvent, ProgressLog, ProgressSink};
use aptup::types::{Activity, ChangeSet, CheckState, PackageRecord, SelectionView};
use aptup::worker::Operation;

#[derive(Debug, Clone, PartialEq)]
enum Note {
    Packages(Vec<String>),
    Activity(Activity),
    Selection(ChangeSet),
    Failed(OperationFailure),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Note>>>);

impl Recorder {
    fn notes(&self) -> Vec<Note> {
        self.0.lock().unwrap().clone()
    }

    fn activities(&self) -> Vec<Activity> {
        self.notes()
            .into_iter()
            .filter_map(|n| match n {
                Note::Activity(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    fn failures(&self) -> Vec<OperationFailure> {
        self.notes()
            .into_iter()
            .filter_map(|n| match n {
                Note::Failed(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn push(&self, note: Note) {
        self.0.lock().unwrap().push(note);
    }
}

impl Observer for Recorder {
    fn packages_changed(&mut self, packages: &[PackageRecord]) {
        self.push(Note::Packages(packages.iter().map(|p| p.name.clone()).collect()));
    }

    fn activity_changed(&mut self, activity: Activity) {
        self.push(Note::Activity(activity));
    }

    fn selection_changed(&mut self, view: &SelectionView) {
        self.push(Note::Selection(view.change_set.clone()));
    }

    fn operation_failed(&mut self, failure: &OperationFailure) {
        self.push(Note::Failed(failure.clone()));
    }
}

struct Harness {
    coordinator: Coordinator,
    recorder: Recorder,
    journal: Journal,
}

fn start(cache: MemoryCache) -> Harness {
    let recorder = Recorder::default();
    let journal = cache.journal();
    let coordinator = Coordinator::spawn(
        move || Ok(cache),
        ProgressLog::default(),
        Box::new(recorder.clone()),
    )
    .unwrap();
    Harness {
        coordinator,
        recorder,
        journal,
    }
}

fn wait_idle(coordinator: &mut Coordinator) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while coordinator.is_busy() {
        assert!(Instant::now() < deadline, "coordinator stuck in {}", coordinator.activity());
        coordinator.poll_timeout(Duration::from_millis(20));
    }
}

fn refreshed(cache: MemoryCache) -> Harness {
    let mut h = start(cache);
    h.coordinator.refresh().unwrap();
    wait_idle(&mut h.coordinator);
    h
}

fn journal(h: &Harness) -> Vec<String> {
    h.journal.lock().unwrap().clone()
}

fn set(names: &[&str]) -> ChangeSet {
    names.iter().map(|n| (*n).to_string()).collect()
}

fn a_and_b() -> MemoryCache {
    MemoryCache::new([
        MemoryPackage::upgradable("A", "1.0", "1.1").describe("library A"),
        MemoryPackage::upgradable("B", "2.0", "2.1").depends_on(&["A"]),
        MemoryPackage::upgradable("current", "3.0", "3.0"),
    ])
}

#[test]
fn selecting_a_dependent_pulls_in_its_dependency() {
    let mut h = refreshed(a_and_b());

    let view = h.coordinator.apply_toggle("B", true).unwrap().clone();
    assert_eq!(view.change_set, set(&["A", "B"]));
    assert_eq!(view.state_of("A"), CheckState::Dependency);
    assert_eq!(view.state_of("B"), CheckState::Selected);

    let view = h.coordinator.apply_toggle("B", false).unwrap().clone();
    assert!(view.change_set.is_empty());
    assert_eq!(view.state_of("A"), CheckState::Unselected);
    assert_eq!(view.state_of("B"), CheckState::Unselected);
    assert_eq!(h.coordinator.selection(), &view);
}

#[test]
fn refresh_lists_only_upgradable_packages_with_nothing_selected() {
    let mut h = refreshed(a_and_b());
    h.coordinator.apply_toggle("A", true).unwrap();

    h.coordinator.refresh().unwrap();
    assert_eq!(h.coordinator.activity(), Activity::Refreshing);
    wait_idle(&mut h.coordinator);

    let names: Vec<&str> = h.coordinator.packages().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["A", "B"]);
    assert!(h.coordinator.selection().is_empty());
    assert_eq!(h.coordinator.describe("A").unwrap().description, "library A");
    assert!(h.coordinator.describe("current").is_none());
}

#[test]
fn commit_with_nothing_selected_queues_nothing() {
    let mut h = refreshed(a_and_b());

    assert_eq!(h.coordinator.commit(), Err(CoordinatorError::NothingSelected));
    assert_eq!(h.coordinator.activity(), Activity::Idle);
    h.coordinator.shutdown();
    assert!(!h.journal.lock().unwrap().iter().any(|e| e.starts_with("commit")));
}

#[test]
fn install_clears_selection_and_refreshes() {
    let mut h = refreshed(a_and_b());
    h.coordinator.apply_toggle("B", true).unwrap();

    h.coordinator.commit().unwrap();
    assert_eq!(h.coordinator.activity(), Activity::Installing);
    wait_idle(&mut h.coordinator);

    assert!(h.coordinator.selection().is_empty());
    assert!(h.coordinator.packages().is_empty());
    assert!(h.recorder.failures().is_empty());
    assert_eq!(
        h.recorder.activities(),
        [
            Activity::Refreshing,
            Activity::Idle,
            Activity::Installing,
            Activity::Refreshing,
            Activity::Idle,
        ]
    );
    assert_eq!(
        journal(&h),
        [
            "refresh:start",
            "refresh:end",
            "commit:start",
            "commit:end",
            "refresh:start",
            "refresh:end",
        ]
    );
}

#[test]
fn failed_install_is_reported_and_still_refreshes() {
    let mut cache = a_and_b();
    cache.fail_next_commit("dpkg was interrupted");
    let mut h = refreshed(cache);
    h.coordinator.apply_toggle("A", true).unwrap();

    h.coordinator.commit().unwrap();
    wait_idle(&mut h.coordinator);

    assert_eq!(
        h.recorder.failures(),
        [OperationFailure {
            operation: Operation::InstallSelected,
            error: CacheError::Commit("dpkg was interrupted".into()),
        }]
    );
    assert!(h.coordinator.selection().is_empty());
    assert_eq!(h.coordinator.packages().len(), 2);
    assert_eq!(journal(&h).last().map(String::as_str), Some("refresh:end"));
}

#[test]
fn failed_refresh_returns_to_idle_and_keeps_going() {
    let mut cache = a_and_b();
    cache.fail_next_refresh("mirror unreachable");
    let mut h = start(cache);

    h.coordinator.refresh().unwrap();
    wait_idle(&mut h.coordinator);
    assert_eq!(h.recorder.failures().len(), 1);
    assert_eq!(h.recorder.failures()[0].operation, Operation::RefreshPackages);
    assert!(h.coordinator.packages().is_empty());

    h.coordinator.refresh().unwrap();
    wait_idle(&mut h.coordinator);
    assert_eq!(h.coordinator.packages().len(), 2);
}

#[test]
fn everything_but_polling_is_rejected_while_busy() {
    let mut h = start(a_and_b().with_latency(Duration::from_millis(50)));
    h.coordinator.refresh().unwrap();

    let busy = Err(CoordinatorError::Busy(Activity::Refreshing));
    assert_eq!(h.coordinator.refresh().map(|_| ()), busy);
    assert_eq!(h.coordinator.commit().map(|_| ()), busy);
    assert_eq!(h.coordinator.apply_toggle("A", true).map(|_| ()), busy);
    assert_eq!(h.coordinator.select_all().map(|_| ()), busy);
    assert_eq!(h.coordinator.clear_selection().map(|_| ()), busy);

    wait_idle(&mut h.coordinator);
    assert!(h.coordinator.apply_toggle("A", true).is_ok());
}

#[test]
fn unknown_package_is_reported_to_the_caller() {
    let mut h = refreshed(a_and_b());
    assert_eq!(
        h.coordinator.apply_toggle("ghost", true).map(|_| ()),
        Err(CoordinatorError::Cache(CacheError::UnknownPackage("ghost".into())))
    );
    assert!(h.coordinator.selection().is_empty());
}

#[test]
fn select_all_and_clear() {
    let mut h = refreshed(a_and_b());

    let view = h.coordinator.select_all().unwrap();
    assert_eq!(view.change_set, set(&["A", "B"]));
    assert_eq!(view.direct().count(), 2);

    let view = h.coordinator.clear_selection().unwrap();
    assert!(view.is_empty());
    assert_eq!(h.coordinator.commit(), Err(CoordinatorError::NothingSelected));
}

#[test]
fn shutdown_delivers_completions_still_in_flight() {
    let h = start(a_and_b().with_latency(Duration::from_millis(30)));
    let Harness {
        mut coordinator,
        recorder,
        ..
    } = h;

    coordinator.refresh().unwrap();
    coordinator.shutdown();

    assert!(
        recorder
            .notes()
            .contains(&Note::Packages(vec!["A".into(), "B".into()]))
    );
    assert_eq!(recorder.activities().last(), Some(&Activity::Idle));
}

#[test]
fn progress_lines_accumulate_until_drained() {
    let mut h = refreshed(a_and_b());
    h.coordinator.apply_toggle("B", true).unwrap();
    h.coordinator.commit().unwrap();
    wait_idle(&mut h.coordinator);

    let events = h.coordinator.drain_events();
    assert_eq!(events.first(), Some(&ProgressEvent::Started { phase: Phase::Metadata }));
    assert!(events.contains(&ProgressEvent::FetchStarted { item: "B".into() }));
    assert!(events.contains(&ProgressEvent::Done { phase: Phase::Install }));
    assert!(h.coordinator.drain_log().is_empty());

    h.coordinator.refresh().unwrap();
    wait_idle(&mut h.coordinator);
    let lines = h.coordinator.drain_log();
    assert_eq!(lines.first().map(String::as_str), Some("Updating package lists..."));
    assert_eq!(lines.last().map(String::as_str), Some("Updating package lists: done."));
}

#[test]
fn overflowed_progress_is_announced_in_the_log() {
    let mut coordinator =
        Coordinator::spawn(|| Ok(a_and_b()), ProgressLog::new(2), Box::new(NullObserver))
            .unwrap();
    coordinator.refresh().unwrap();
    wait_idle(&mut coordinator);

    // Started, FetchDone and Done were pushed into room for two
    let lines = coordinator.drain_log();
    assert_eq!(
        lines,
        [
            "(1 earlier progress line(s) dropped)",
            "Done: Packages",
            "Updating package lists: done.",
        ]
    );
    assert!(coordinator.drain_log().is_empty());
}

/// Panic payload whose destructor panics too, so the worker thread dies
/// after the operation's panic has been caught
struct Volatile;

impl Drop for Volatile {
    fn drop(&mut self) {
        panic!("payload destructor");
    }
}

struct DoomedCache;

impl PackageCache for DoomedCache {
    fn refresh(&mut self, _: &ProgressSink) -> Result<Vec<PackageRecord>, CacheError> {
        std::panic::panic_any(Volatile);
    }
    fn mark_upgrade(&mut self, _: &str) -> Result<(), CacheError> {
        Ok(())
    }
    fn clear_marks(&mut self) {}
    fn resolved_changes(&mut self) -> ChangeSet {
        ChangeSet::new()
    }
    fn commit(&mut self, _: &ProgressSink) -> Result<(), CacheError> {
        Ok(())
    }
}

#[test]
fn dead_worker_fails_pending_operations_and_goes_idle() {
    let recorder = Recorder::default();
    let mut coordinator =
        Coordinator::spawn(|| Ok(DoomedCache), ProgressLog::default(), Box::new(recorder.clone()))
            .unwrap();

    coordinator.refresh().unwrap();
    wait_idle(&mut coordinator);

    assert_eq!(
        recorder.failures(),
        [OperationFailure {
            operation: Operation::RefreshPackages,
            error: CacheError::WorkerExited,
        }]
    );
    assert_eq!(coordinator.refresh(), Err(CoordinatorError::WorkerGone));
    assert_eq!(coordinator.activity(), Activity::Idle);
}
