// ABOUTME: Configuration for the knowlog store: root directory and compaction/retention knobs.
// ABOUTME: Values come from explicit construction or from KNOWLOG_* environment variables.

use std::path::PathBuf;

use thiserror::Error;

/// Events kept by `compact_event_log` when the caller does not say otherwise.
pub const DEFAULT_KEEP_RECENT_EVENTS: usize = 1000;

/// Snapshots kept by `prune_snapshots` when the caller does not say otherwise.
pub const DEFAULT_SNAPSHOT_KEEP: usize = 10;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Store configuration. The root is always an explicit path; nothing is
/// resolved relative to the running executable.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub keep_recent_events: usize,
    pub snapshot_keep: usize,
    /// fsync every append before returning.
    pub sync_writes: bool,
}

impl StoreConfig {
    /// Configuration rooted at `root` with default knobs.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_recent_events: DEFAULT_KEEP_RECENT_EVENTS,
            snapshot_keep: DEFAULT_SNAPSHOT_KEEP,
            sync_writes: true,
        }
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - KNOWLOG_HOME: storage root (default: ~/.knowlog)
    /// - KNOWLOG_KEEP_RECENT_EVENTS: compaction window (default: 1000)
    /// - KNOWLOG_SNAPSHOT_KEEP: snapshots retained when pruning (default: 10)
    /// - KNOWLOG_SYNC_WRITES: fsync after each append (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let root = std::env::var("KNOWLOG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".knowlog")
            });

        let keep_recent_events =
            positive_from_env("KNOWLOG_KEEP_RECENT_EVENTS", DEFAULT_KEEP_RECENT_EVENTS)?;
        let snapshot_keep = positive_from_env("KNOWLOG_SNAPSHOT_KEEP", DEFAULT_SNAPSHOT_KEEP)?;

        let sync_writes = std::env::var("KNOWLOG_SYNC_WRITES")
            .map(|v| v == "true" || v == "1" || v == "yes")
            .unwrap_or(true);

        Ok(Self {
            root,
            keep_recent_events,
            snapshot_keep,
            sync_writes,
        })
    }
}

fn positive_from_env(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::InvalidNumber { var, value }),
        },
    }
}
