//! Progress reporting for refresh, download, and install operations.
//!
//! Cache operations run on the worker thread and report through a `ProgressSink`.
//! The sink appends `ProgressEvent`s to a `ProgressLog`, a bounded buffer shared
//! with the coordinator, which drains it on its own schedule. Nothing on the
//! worker side ever touches front-end state directly.
//!
//! `AptAcquireProgress` and `AptInstallProgress` adapt rust-apt's progress traits
//! onto a sink.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rust_apt::raw::{AcqTextStatus, ItemDesc, PkgAcquire};
use tracing::trace;

use crate::types::size_str;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Downloading package lists
    Metadata,
    /// Downloading package archives
    Download,
    /// Unpacking and configuring
    Install,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => write!(f, "Updating package lists"),
            Self::Download => write!(f, "Downloading packages"),
            Self::Install => write!(f, "Installing packages"),
        }
    }
}

/// Periodic numeric progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pulse {
    pub current_items: u64,
    pub total_items: u64,
    pub current_bytes: u64,
    pub total_bytes: u64,
    /// Bytes per second
    pub rate: u64,
    pub elapsed: Duration,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started { phase: Phase },
    Progress(Pulse),
    FetchStarted { item: String },
    FetchDone { item: String },
    FetchFailed { item: String, reason: String },
    InstallStatus { package: String, percent: f64, status: String },
    Processing { package: String, stage: String },
    InstallError { package: String, message: String },
    Done { phase: Phase },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { phase } => write!(f, "{phase}..."),
            Self::Progress(p) => {
                write!(f, "{:.0}%", p.percent)?;
                if p.total_bytes > 0 {
                    write!(f, "  {} / {}", size_str(p.current_bytes), size_str(p.total_bytes))?;
                }
                if p.rate > 0 {
                    write!(f, "  {}/s", size_str(p.rate))?;
                }
                if p.total_items > 0 {
                    write!(f, "  [{}/{} items]", p.current_items, p.total_items)?;
                }
                write!(f, "  {}s elapsed", p.elapsed.as_secs())
            }
            Self::FetchStarted { item } => write!(f, "Get: {item}"),
            Self::FetchDone { item } => write!(f, "Done: {item}"),
            Self::FetchFailed { item, reason } => write!(f, "Failed: {item}: {reason}"),
            Self::InstallStatus { package, percent, status } => {
                if package.is_empty() {
                    write!(f, "[{percent:.0}%] {status}")
                } else {
                    write!(f, "[{percent:.0}%] {status} {package}")
                }
            }
            Self::Processing { package, stage } => write!(f, "{stage}: {package}"),
            Self::InstallError { package, message } => write!(f, "Error: {package}: {message}"),
            Self::Done { phase } => write!(f, "{phase}: done."),
        }
    }
}

// ============================================================================
// Shared buffer
// ============================================================================

struct LogBuffer {
    events: VecDeque<ProgressEvent>,
    capacity: usize,
    dropped: u64,
}

/// Bounded append-only event buffer shared between worker and coordinator.
/// When full, the oldest undrained event is discarded.
#[derive(Clone)]
pub struct ProgressLog {
    inner: Arc<Mutex<LogBuffer>>,
}

impl ProgressLog {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogBuffer {
                events: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: ProgressEvent) {
        trace!(%event, "progress");
        let mut buf = self.lock();
        if buf.events.len() >= buf.capacity {
            buf.events.pop_front();
            buf.dropped += 1;
        }
        buf.events.push_back(event);
    }

    /// Take everything appended since the last drain
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.drain_counted().0
    }

    /// Like `drain`, plus how many events were discarded since the last drain
    /// because the buffer was full
    pub fn drain_counted(&self) -> (Vec<ProgressEvent>, u64) {
        let mut buf = self.lock();
        let dropped = std::mem::take(&mut buf.dropped);
        (buf.events.drain(..).collect(), dropped)
    }
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

// ============================================================================
// Sink (hook points called by cache implementations)
// ============================================================================

#[derive(Clone)]
pub struct ProgressSink {
    log: ProgressLog,
}

impl ProgressSink {
    pub fn new(log: ProgressLog) -> Self {
        Self { log }
    }

    pub fn start(&self, phase: Phase) {
        self.log.push(ProgressEvent::Started { phase });
    }

    pub fn pulse(&self, pulse: Pulse) {
        self.log.push(ProgressEvent::Progress(pulse));
    }

    pub fn fetch_started(&self, item: impl Into<String>) {
        self.log.push(ProgressEvent::FetchStarted { item: item.into() });
    }

    pub fn fetch_done(&self, item: impl Into<String>) {
        self.log.push(ProgressEvent::FetchDone { item: item.into() });
    }

    pub fn fetch_failed(&self, item: impl Into<String>, reason: impl Into<String>) {
        self.log.push(ProgressEvent::FetchFailed {
            item: item.into(),
            reason: reason.into(),
        });
    }

    pub fn status_change(&self, package: impl Into<String>, percent: f64, status: impl Into<String>) {
        self.log.push(ProgressEvent::InstallStatus {
            package: package.into(),
            percent,
            status: status.into(),
        });
    }

    pub fn processing(&self, package: impl Into<String>, stage: impl Into<String>) {
        self.log.push(ProgressEvent::Processing {
            package: package.into(),
            stage: stage.into(),
        });
    }

    pub fn error(&self, package: impl Into<String>, message: impl Into<String>) {
        self.log.push(ProgressEvent::InstallError {
            package: package.into(),
            message: message.into(),
        });
    }

    pub fn done(&self, phase: Phase) {
        self.log.push(ProgressEvent::Done { phase });
    }
}

// ============================================================================
// DynAcquireProgress implementation
// ============================================================================

pub struct AptAcquireProgress {
    sink: ProgressSink,
    phase: Phase,
    pulse_interval: Duration,
}

impl AptAcquireProgress {
    pub fn new(sink: ProgressSink, phase: Phase, pulse_interval: Duration) -> Self {
        Self { sink, phase, pulse_interval }
    }
}

impl rust_apt::progress::DynAcquireProgress for AptAcquireProgress {
    fn pulse_interval(&self) -> usize {
        self.pulse_interval.as_micros() as usize
    }

    fn hit(&mut self, item: &ItemDesc) {
        self.sink.fetch_done(item.short_desc());
    }

    fn fetch(&mut self, item: &ItemDesc) {
        self.sink.fetch_started(item.short_desc());
    }

    fn done(&mut self, item: &ItemDesc) {
        self.sink.fetch_done(item.short_desc());
    }

    fn fail(&mut self, item: &ItemDesc) {
        let error_text = item.owner().error_text();
        self.sink.fetch_failed(item.short_desc(), error_text);
    }

    fn pulse(&mut self, status: &AcqTextStatus, _owner: &PkgAcquire) {
        self.sink.pulse(Pulse {
            current_items: status.current_items(),
            total_items: status.total_items(),
            current_bytes: status.current_bytes(),
            total_bytes: status.total_bytes(),
            rate: status.current_cps(),
            elapsed: Duration::from_secs(status.elapsed_time()),
            percent: status.percent(),
        });
    }

    fn start(&mut self) {
        self.sink.start(self.phase);
    }

    fn stop(&mut self, _status: &AcqTextStatus) {
        self.sink.done(self.phase);
    }
}

// ============================================================================
// DynInstallProgress implementation
// ============================================================================

pub struct AptInstallProgress {
    sink: ProgressSink,
    started: bool,
}

impl AptInstallProgress {
    pub fn new(sink: ProgressSink) -> Self {
        Self { sink, started: false }
    }
}

impl rust_apt::progress::DynInstallProgress for AptInstallProgress {
    fn status_changed(
        &mut self,
        pkgname: String,
        steps_done: u64,
        total_steps: u64,
        action: String,
    ) {
        if !self.started {
            self.started = true;
            self.sink.start(Phase::Install);
        }
        let percent = if total_steps > 0 {
            (steps_done as f64 / total_steps as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.sink.status_change(pkgname, percent, action);
    }

    fn error(&mut self, pkgname: String, _steps_done: u64, _total_steps: u64, error: String) {
        self.sink.error(pkgname, error);
    }
}

impl Drop for AptInstallProgress {
    fn drop(&mut self) {
        if self.started {
            self.sink.done(Phase::Install);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_events_once() {
        let log = ProgressLog::default();
        let sink = ProgressSink::new(log.clone());
        sink.start(Phase::Download);
        sink.fetch_started("http://deb.example/pool foo 1.1");
        sink.done(Phase::Download);

        let drained = log.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], ProgressEvent::Started { phase: Phase::Download });
        assert!(log.drain().is_empty());
    }

    #[test]
    fn full_buffer_discards_oldest() {
        let log = ProgressLog::new(2);
        let sink = ProgressSink::new(log.clone());
        sink.fetch_started("a");
        sink.fetch_started("b");
        sink.fetch_started("c");

        let (events, dropped) = log.drain_counted();
        let items: Vec<String> = events.iter().map(ToString::to_string).collect();
        assert_eq!(items, ["Get: b", "Get: c"]);
        assert_eq!(dropped, 1);

        sink.fetch_started("d");
        assert_eq!(log.drain_counted().1, 0);
    }

    #[test]
    fn pulse_line_includes_bytes_rate_and_items() {
        let event = ProgressEvent::Progress(Pulse {
            current_items: 3,
            total_items: 10,
            current_bytes: 1024 * 1024,
            total_bytes: 4 * 1024 * 1024,
            rate: 512 * 1024,
            elapsed: Duration::from_secs(7),
            percent: 25.0,
        });
        assert_eq!(
            event.to_string(),
            "25%  1.0 MB / 4.0 MB  512.0 KB/s  [3/10 items]  7s elapsed"
        );
    }

    #[test]
    fn install_lines() {
        let status = ProgressEvent::InstallStatus {
            package: "libfoo".into(),
            percent: 50.0,
            status: "Unpacking".into(),
        };
        assert_eq!(status.to_string(), "[50%] Unpacking libfoo");

        let err = ProgressEvent::InstallError {
            package: "libfoo".into(),
            message: "subprocess returned 1".into(),
        };
        assert_eq!(err.to_string(), "Error: libfoo: subprocess returned 1");
    }
}
