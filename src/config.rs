//! Configuration file loading
//!
//! Every key is optional; a missing file means all defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::progress::ProgressLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How often the front end polls for completions
    pub poll_interval_ms: u64,
    /// Minimum spacing between download progress pulses
    pub pulse_interval_ms: u64,
    /// Progress events kept before the oldest are dropped
    pub log_capacity: usize,
    /// Download fresh package lists on refresh (false: only reload the local cache)
    pub update_metadata: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            pulse_interval_ms: 500,
            log_capacity: ProgressLog::DEFAULT_CAPACITY,
            update_metadata: true,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from `explicit`, or the first default location that exists.
    /// No file at all means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => locate(|key| std::env::var_os(key).map(PathBuf::from)),
        };

        match path {
            Some(path) if explicit.is_some() || path.exists() => Self::from_file(&path),
            _ => {
                debug!("no config file; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }
}

/// `$APTUP_CONFIG`, then `$XDG_CONFIG_HOME/aptup/config.toml`,
/// then `$HOME/.config/aptup/config.toml`
fn locate(env: impl Fn(&str) -> Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = env("APTUP_CONFIG") {
        return Some(path);
    }
    let base = env("XDG_CONFIG_HOME")
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| env("HOME").map(|home| home.join(".config")))?;
    Some(base.join("aptup").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "poll_interval_ms = 250\nupdate_metadata = false\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(!config.update_metadata);
        assert_eq!(config.log_capacity, ProgressLog::DEFAULT_CAPACITY);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();

        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn lookup_order() {
        let env = |vars: &'static [(&'static str, &'static str)]| {
            move |key: &str| {
                vars.iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| PathBuf::from(v))
            }
        };

        assert_eq!(
            locate(env(&[("APTUP_CONFIG", "/etc/aptup.toml"), ("HOME", "/home/u")])),
            Some(PathBuf::from("/etc/aptup.toml"))
        );
        assert_eq!(
            locate(env(&[("XDG_CONFIG_HOME", "/xdg"), ("HOME", "/home/u")])),
            Some(PathBuf::from("/xdg/aptup/config.toml"))
        );
        assert_eq!(
            locate(env(&[("XDG_CONFIG_HOME", ""), ("HOME", "/home/u")])),
            Some(PathBuf::from("/home/u/.config/aptup/config.toml"))
        );
        assert_eq!(locate(env(&[])), None);
    }
}
