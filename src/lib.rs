//! aptup - background package operations for an apt upgrade front end
//!
//! The `Coordinator` keeps a front end responsive: package list refreshes and
//! installs run on a single worker thread that owns the package cache, while
//! selection edits are reconciled against the dependency solver so every row's
//! check state matches what would actually be installed.

pub mod apt;
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod progress;
pub mod reconcile;
pub mod types;
pub mod worker;
