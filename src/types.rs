//! Common types used throughout the crate

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The set of package names the solver will actually change, given current marks
pub type ChangeSet = BTreeSet<String>;

/// One upgradable package as seen by the last refresh.
/// Records are never mutated; a refresh replaces the whole list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub installed_version: Option<String>,
    pub candidate_version: Option<String>,
    pub description: String,
    pub download_size: u64,
}

impl PackageRecord {
    /// Installed, has a candidate, and the two differ
    pub fn is_upgradable(&self) -> bool {
        match (&self.installed_version, &self.candidate_version) {
            (Some(installed), Some(candidate)) => installed != candidate,
            _ => false,
        }
    }

    pub fn installed_str(&self) -> &str {
        self.installed_version.as_deref().unwrap_or("-")
    }

    pub fn candidate_str(&self) -> &str {
        self.candidate_version.as_deref().unwrap_or("-")
    }

    pub fn download_size_str(&self) -> String {
        size_str(self.download_size)
    }
}

/// Human-readable byte count
pub fn size_str(bytes: u64) -> String {
    if bytes == 0 {
        return String::from("-");
    }
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Visible check state of one package row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Unselected,
    /// The user checked it
    Selected,
    /// In the change set only because a selected package pulls it in
    Dependency,
}

impl CheckState {
    pub fn is_checked(&self) -> bool {
        !matches!(self, Self::Unselected)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Unselected => "[ ]",
            Self::Selected => "[x]",
            Self::Dependency => "[d]",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unselected | Self::Selected => "",
            Self::Dependency => "dep",
        }
    }
}

/// Result of one reconciliation pass: what every row should show.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionView {
    /// Check state for every known package and every package in the change set
    pub rows: BTreeMap<String, CheckState>,
    pub change_set: ChangeSet,
    /// Direct selections dropped this pass because the solver would not keep them
    pub demoted: Vec<String>,
}

impl SelectionView {
    pub fn state_of(&self, name: &str) -> CheckState {
        self.rows.get(name).copied().unwrap_or(CheckState::Unselected)
    }

    pub fn is_empty(&self) -> bool {
        self.change_set.is_empty()
    }

    pub fn direct(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .filter(|(_, state)| **state == CheckState::Selected)
            .map(|(name, _)| name.as_str())
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .filter(|(_, state)| **state == CheckState::Dependency)
            .map(|(name, _)| name.as_str())
    }
}

/// Coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    Idle,
    Refreshing,
    Installing,
}

impl Activity {
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Refreshing => write!(f, "refreshing package lists"),
            Self::Installing => write!(f, "installing upgrades"),
        }
    }
}
