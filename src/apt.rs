//! APT cache operations
//!
//! This module provides a thin wrapper around rust-apt implementing `PackageCache`.
//! Selection state is handled by the reconciler, not here.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::Duration;

use rust_apt::cache::{Cache, PackageSort};
use rust_apt::error::AptErrors;
use rust_apt::progress::{AcquireProgress, InstallProgress};
use rust_apt::Package;
use tracing::{debug, info, warn};

use crate::cache::PackageCache;
use crate::error::CacheError;
use crate::progress::{AptAcquireProgress, AptInstallProgress, Phase, ProgressSink};
use crate::types::{ChangeSet, PackageRecord};

/// Owns a libapt cache. `rust_apt::Cache` is not `Send`, so an `AptCache` must be
/// opened on the thread that will use it.
pub struct AptCache {
    cache: Cache,
    /// ":amd64" or similar
    native_arch_suffix: String,
    pulse_interval: Duration,
    update_metadata: bool,
}

impl AptCache {
    pub fn open(pulse_interval: Duration, update_metadata: bool) -> Result<Self, CacheError> {
        let cache = open_cache()?;
        let arch = native_arch();
        debug!(%arch, "native architecture");

        Ok(Self {
            cache,
            native_arch_suffix: format!(":{arch}"),
            pulse_interval,
            update_metadata,
        })
    }

    /// Package names carry an arch qualifier only when it differs from the
    /// native one: `libfoo:amd64` lists as `libfoo` on amd64, `libfoo:i386` stays.
    pub fn display_name<'a>(&self, fullname: &'a str) -> &'a str {
        fullname
            .strip_suffix(self.native_arch_suffix.as_str())
            .unwrap_or(fullname)
    }

    fn record(&self, pkg: &Package) -> Option<PackageRecord> {
        let candidate = pkg.candidate()?;
        let installed_version = pkg.installed().map(|v| v.version().to_string());

        Some(PackageRecord {
            name: self.display_name(&pkg.fullname(false)).to_string(),
            installed_version,
            candidate_version: Some(candidate.version().to_string()),
            description: candidate.summary().unwrap_or_default(),
            download_size: candidate.size(),
        })
    }
}

impl PackageCache for AptCache {
    fn refresh(&mut self, progress: &ProgressSink) -> Result<Vec<PackageRecord>, CacheError> {
        ensure_unlocked()?;

        if self.update_metadata {
            let mut acquire = AcquireProgress::new(AptAcquireProgress::new(
                progress.clone(),
                Phase::Metadata,
                self.pulse_interval,
            ));
            let cache = std::mem::replace(&mut self.cache, open_cache()?);
            cache
                .update(&mut acquire)
                .map_err(|e| CacheError::Update(format_apt_errors(&e)))?;
        }

        // Reload from disk; marks and stale state go with the old cache
        self.cache = open_cache()?;

        let records: Vec<PackageRecord> = self
            .cache
            .packages(&PackageSort::default().upgradable())
            .filter_map(|pkg| self.record(&pkg))
            .collect();
        info!(upgradable = records.len(), "package cache reloaded");
        Ok(records)
    }

    fn mark_upgrade(&mut self, name: &str) -> Result<(), CacheError> {
        let pkg = self
            .cache
            .get(name)
            .ok_or_else(|| CacheError::UnknownPackage(name.to_string()))?;
        // No protect(): clear_marks() must be able to reset everything
        if !pkg.mark_install(true, true) {
            debug!(package = name, "apt refused mark");
        }
        Ok(())
    }

    fn clear_marks(&mut self) {
        let marked: Vec<String> = self
            .cache
            .get_changes(false)
            .map(|pkg| pkg.fullname(false))
            .collect();

        for pkg in marked.iter().filter_map(|name| self.cache.get(name)) {
            pkg.mark_keep();
        }
    }

    fn resolved_changes(&mut self) -> ChangeSet {
        if let Err(e) = self.cache.resolve(true) {
            warn!(error = %format_apt_errors(&e), "dependency resolution incomplete");
        }
        self.cache
            .get_changes(false)
            .map(|pkg| self.display_name(&pkg.fullname(false)).to_string())
            .collect()
    }

    fn commit(&mut self, progress: &ProgressSink) -> Result<(), CacheError> {
        ensure_unlocked()?;

        let mut acquire = AcquireProgress::new(AptAcquireProgress::new(
            progress.clone(),
            Phase::Download,
            self.pulse_interval,
        ));
        let mut install = InstallProgress::new(AptInstallProgress::new(progress.clone()));

        let cache = std::mem::replace(&mut self.cache, open_cache()?);
        let result = cache.commit(&mut acquire, &mut install);

        // Whatever happened, the system changed underneath; reopen
        self.cache = open_cache()?;
        result.map_err(|e| CacheError::Commit(format_apt_errors(&e)))
    }
}

fn open_cache() -> Result<Cache, CacheError> {
    Cache::new::<&str>(&[]).map_err(|e| CacheError::Open(format_apt_errors(&e)))
}

fn native_arch() -> String {
    std::process::Command::new("dpkg")
        .arg("--print-architecture")
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|arch| !arch.is_empty())
        .unwrap_or_else(|| "amd64".to_string())
}

/// Collapse libapt's error stack into one line: the first real message, plus
/// a count of the rest
pub fn format_apt_errors(errors: &AptErrors) -> String {
    let messages: Vec<String> = errors
        .iter()
        .map(ToString::to_string)
        .filter(|msg| !msg.is_empty() && msg != "E:")
        .collect();

    match messages.as_slice() {
        [] => "apt reported an error without details".to_string(),
        [only] => only.clone(),
        [first, rest @ ..] => format!("{first} (+{} more)", rest.len()),
    }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

const LOCK_FILES: [&str; 3] = [
    "/var/lib/dpkg/lock-frontend",
    "/var/lib/dpkg/lock",
    "/var/lib/apt/lists/lock",
];

/// Fail fast with `Locked` if another package manager holds a dpkg or apt lock.
/// Lock files we cannot open (not root, not present) are skipped.
pub fn ensure_unlocked() -> Result<(), CacheError> {
    for path in LOCK_FILES {
        let Ok(file) = File::open(path) else {
            continue;
        };
        let fd = file.as_raw_fd();
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            warn!(lock = path, "package manager lock is held");
            return Err(CacheError::Locked(format!(
                "{path} is held by another package manager"
            )));
        }
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
    Ok(())
}
