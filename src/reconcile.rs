//! Selection reconciliation
//!
//! The user edits a set of direct selections; the solver decides what actually
//! changes. After every edit the two are reconciled:
//! - direct selections are the source of truth for cache marks
//! - unmarking rebuilds all marks from scratch, since the solver cannot drop one
//!   mark while keeping the dependency marks still justified by others
//! - every row's check state is derived from the resolved change set, so the
//!   visible state never disagrees with the solver's plan

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::cache::PackageCache;
use crate::error::CacheError;
use crate::types::{ChangeSet, CheckState, SelectionView};

#[derive(Default)]
pub struct SelectionReconciler {
    /// name -> directly selected. Absent means false.
    direct: BTreeMap<String, bool>,
    /// Names from the last refresh; every one of them gets a row
    known: Vec<String>,
}

impl SelectionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known package list. Old selections do not carry over.
    pub fn set_known(&mut self, known: Vec<String>) {
        self.direct.clear();
        self.known = known;
    }

    pub fn is_direct(&self, name: &str) -> bool {
        self.direct.get(name).copied().unwrap_or(false)
    }

    pub fn direct_names(&self) -> impl Iterator<Item = &str> {
        self.direct
            .iter()
            .filter(|(_, selected)| **selected)
            .map(|(name, _)| name.as_str())
    }

    /// Toggle one package and reconcile
    pub fn toggle(
        &mut self,
        cache: &mut dyn PackageCache,
        name: &str,
        want_selected: bool,
    ) -> Result<SelectionView, CacheError> {
        let mut lost = Vec::new();
        if want_selected {
            cache.mark_upgrade(name)?;
            self.direct.insert(name.to_string(), true);
        } else {
            self.direct.insert(name.to_string(), false);
            lost = self.rebuild(cache);
        }
        Ok(self.render(cache, lost))
    }

    /// Directly select every known package
    pub fn select_all(&mut self, cache: &mut dyn PackageCache) -> SelectionView {
        for name in &self.known {
            match cache.mark_upgrade(name) {
                Ok(()) => {
                    self.direct.insert(name.clone(), true);
                }
                Err(e) => warn!(package = %name, error = %e, "skipping package"),
            }
        }
        self.render(cache, Vec::new())
    }

    /// Drop every selection and every cache mark
    pub fn clear(&mut self, cache: &mut dyn PackageCache) -> SelectionView {
        self.reset(cache);
        self.render(cache, Vec::new())
    }

    /// Forget selections without rendering (after commit or before refresh)
    pub fn reset(&mut self, cache: &mut dyn PackageCache) {
        self.direct.clear();
        cache.clear_marks();
    }

    /// Clear all marks and replay only the direct selections.
    /// Returns the selections that could not be marked again.
    fn rebuild(&mut self, cache: &mut dyn PackageCache) -> Vec<String> {
        let before = cache.resolved_changes();
        cache.clear_marks();

        let replay: Vec<String> = self.direct_names().map(String::from).collect();
        let mut failed = Vec::new();
        for name in &replay {
            if let Err(e) = cache.mark_upgrade(name) {
                warn!(package = %name, error = %e, "direct selection no longer markable");
                self.direct.insert(name.clone(), false);
                failed.push(name.clone());
            }
        }
        debug!(before = before.len(), replayed = replay.len(), "marks rebuilt");
        failed
    }

    /// Resolve, demote direct selections the solver dropped, and derive row states.
    ///
    /// A rejected mark can leave its dependencies marked behind it, so every
    /// demotion is followed by a rebuild from the surviving selections. Each
    /// round demotes at least one selection, so this terminates.
    fn render(&mut self, cache: &mut dyn PackageCache, mut demoted: Vec<String>) -> SelectionView {
        let mut change_set: ChangeSet = cache.resolved_changes();

        loop {
            let dropped: Vec<String> = self
                .direct_names()
                .filter(|name| !change_set.contains(*name))
                .map(String::from)
                .collect();
            if dropped.is_empty() {
                break;
            }
            for name in &dropped {
                warn!(package = %name, "selection dropped by the solver");
                self.direct.insert(name.clone(), false);
            }
            demoted.extend(dropped);
            demoted.extend(self.rebuild(cache));
            change_set = cache.resolved_changes();
        }

        let mut rows = BTreeMap::new();
        for name in &self.known {
            rows.insert(name.clone(), CheckState::Unselected);
        }
        for name in &change_set {
            let state = if self.is_direct(name) {
                CheckState::Selected
            } else {
                CheckState::Dependency
            };
            rows.insert(name.clone(), state);
        }

        debug!(
            changes = change_set.len(),
            direct = self.direct_names().count(),
            demoted = demoted.len(),
            "selection reconciled"
        );

        SelectionView {
            rows,
            change_set,
            demoted,
        }
    }
}
