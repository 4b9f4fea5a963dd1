//! The package database seam.
//!
//! `PackageCache` is everything the worker needs from a package manager library.
//! `AptCache` (in `apt`) implements it over libapt; `MemoryCache` implements it over
//! a JSON fixture with a small solver, for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::progress::{Phase, ProgressSink, Pulse};
use crate::types::{ChangeSet, PackageRecord};

/// Exclusive handle to a package database. Only the worker thread ever holds one.
pub trait PackageCache {
    /// Refresh metadata and return every package known afterwards.
    /// Marks do not survive a refresh.
    fn refresh(&mut self, progress: &ProgressSink) -> Result<Vec<PackageRecord>, CacheError>;

    /// Register `name` for upgrade. A mark the solver cannot honour is dropped
    /// silently; it simply won't appear in `resolved_changes`.
    fn mark_upgrade(&mut self, name: &str) -> Result<(), CacheError>;

    fn clear_marks(&mut self);

    /// Run the solver and return the packages it would change
    fn resolved_changes(&mut self) -> ChangeSet;

    /// Download and install the resolved change set
    fn commit(&mut self, progress: &ProgressSink) -> Result<(), CacheError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// One package in a `MemoryCache` fixture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPackage {
    pub name: String,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub candidate_version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
}

impl MemoryPackage {
    pub fn upgradable(name: &str, installed: &str, candidate: &str) -> Self {
        Self {
            name: name.to_string(),
            installed_version: Some(installed.to_string()),
            candidate_version: Some(candidate.to_string()),
            description: String::new(),
            download_size: 0,
            depends: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends.extend(names.iter().map(|n| (*n).to_string()));
        self
    }

    pub fn conflicts_with(mut self, names: &[&str]) -> Self {
        self.conflicts.extend(names.iter().map(|n| (*n).to_string()));
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn needs_change(&self) -> bool {
        self.candidate_version.is_some() && self.installed_version != self.candidate_version
    }

    fn record(&self) -> PackageRecord {
        PackageRecord {
            name: self.name.clone(),
            installed_version: self.installed_version.clone(),
            candidate_version: self.candidate_version.clone(),
            description: self.description.clone(),
            download_size: self.download_size,
        }
    }
}

/// Shared record of which cache operations ran, in order
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Package database held in memory.
///
/// The solver pulls in every dependency that is not already at its candidate
/// version, and refuses a mark whose closure conflicts with the closure of the
/// marks already held.
#[derive(Default)]
pub struct MemoryCache {
    packages: BTreeMap<String, MemoryPackage>,
    marks: BTreeSet<String>,
    latency: Duration,
    fail_refresh: Option<String>,
    fail_commit: Option<String>,
    journal: Journal,
}

impl MemoryCache {
    pub fn new(packages: impl IntoIterator<Item = MemoryPackage>) -> Self {
        Self {
            packages: packages.into_iter().map(|p| (p.name.clone(), p)).collect(),
            ..Self::default()
        }
    }

    /// Load a fixture: a JSON array of `MemoryPackage`
    pub fn from_fixture(path: &Path) -> Result<Self, CacheError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Open(format!("{}: {e}", path.display())))?;
        let packages: Vec<MemoryPackage> = serde_json::from_str(&content)
            .map_err(|e| CacheError::Open(format!("{}: {e}", path.display())))?;
        Ok(Self::new(packages))
    }

    /// Sleep this long inside refresh and commit
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_next_refresh(&mut self, reason: &str) {
        self.fail_refresh = Some(reason.to_string());
    }

    pub fn fail_next_commit(&mut self, reason: &str) {
        self.fail_commit = Some(reason.to_string());
    }

    pub fn journal(&self) -> Journal {
        Arc::clone(&self.journal)
    }

    fn note(&self, entry: &str) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.to_string());
    }

    /// `root` plus every dependency (transitively) that needs changing
    fn closure(&self, root: &str) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut to_check = vec![root.to_string()];

        while let Some(current) = to_check.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(pkg) = self.packages.get(&current) else {
                continue;
            };
            if pkg.needs_change() {
                result.insert(current.clone());
            }
            to_check.extend(pkg.depends.iter().cloned());
        }

        result
    }

    fn conflicting(&self, a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
        let declares = |from: &BTreeSet<String>, against: &BTreeSet<String>| {
            from.iter()
                .filter_map(|name| self.packages.get(name))
                .any(|pkg| pkg.conflicts.iter().any(|c| against.contains(c)))
        };
        declares(a, b) || declares(b, a)
    }

    fn pause(&self) {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }
}

impl PackageCache for MemoryCache {
    fn refresh(&mut self, progress: &ProgressSink) -> Result<Vec<PackageRecord>, CacheError> {
        self.note("refresh:start");
        self.marks.clear();
        progress.start(Phase::Metadata);
        self.pause();

        if let Some(reason) = self.fail_refresh.take() {
            progress.fetch_failed("Packages", reason.clone());
            progress.done(Phase::Metadata);
            self.note("refresh:end");
            return Err(CacheError::Update(reason));
        }

        progress.fetch_done("Packages");
        progress.done(Phase::Metadata);
        self.note("refresh:end");
        Ok(self.packages.values().map(MemoryPackage::record).collect())
    }

    fn mark_upgrade(&mut self, name: &str) -> Result<(), CacheError> {
        if !self.packages.contains_key(name) {
            return Err(CacheError::UnknownPackage(name.to_string()));
        }

        let wanted = self.closure(name);
        let held = self.resolved_changes();
        if self.conflicting(&wanted, &held) {
            debug!(package = name, "mark rejected by conflict");
            return Ok(());
        }

        self.marks.insert(name.to_string());
        Ok(())
    }

    fn clear_marks(&mut self) {
        self.marks.clear();
    }

    fn resolved_changes(&mut self) -> ChangeSet {
        self.marks.iter().flat_map(|name| self.closure(name)).collect()
    }

    fn commit(&mut self, progress: &ProgressSink) -> Result<(), CacheError> {
        self.note("commit:start");
        let changes = self.resolved_changes();
        let total_bytes: u64 = changes
            .iter()
            .filter_map(|n| self.packages.get(n))
            .map(|p| p.download_size)
            .sum();

        progress.start(Phase::Download);
        let mut current_bytes = 0;
        for (i, name) in changes.iter().enumerate() {
            progress.fetch_started(name.as_str());
            self.pause();
            current_bytes += self.packages.get(name).map_or(0, |p| p.download_size);
            progress.fetch_done(name.as_str());
            progress.pulse(Pulse {
                current_items: i as u64 + 1,
                total_items: changes.len() as u64,
                current_bytes,
                total_bytes,
                percent: (i + 1) as f64 / changes.len() as f64 * 100.0,
                ..Pulse::default()
            });
        }
        progress.done(Phase::Download);

        if let Some(reason) = self.fail_commit.take() {
            if let Some(first) = changes.iter().next() {
                progress.error(first.as_str(), reason.clone());
            }
            self.marks.clear();
            self.note("commit:end");
            return Err(CacheError::Commit(reason));
        }

        progress.start(Phase::Install);
        for (i, name) in changes.iter().enumerate() {
            progress.processing(name.as_str(), "Unpacking");
            progress.status_change(
                name.as_str(),
                (i + 1) as f64 / changes.len() as f64 * 100.0,
                "Configuring",
            );
            if let Some(pkg) = self.packages.get_mut(name) {
                pkg.installed_version.clone_from(&pkg.candidate_version);
            }
        }
        progress.done(Phase::Install);

        self.marks.clear();
        self.note("commit:end");
        Ok(())
    }
}
