//! Scan lifecycle types: identifiers, options, status and progress

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Scan identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    /// Create a scan ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random scan ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-run scan configuration
///
/// Created when a scan starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    /// Root directories (or files) to walk
    pub roots: Vec<PathBuf>,

    /// Directory prefixes that are never entered
    #[serde(default)]
    pub excluded_paths: Vec<PathBuf>,

    /// Songs shorter than this are not persisted
    #[serde(default)]
    pub min_duration_ms: u64,

    /// Descend into symlinked directories
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Skip files whose (path, size, mtime) was already indexed by an earlier scan
    #[serde(default)]
    pub skip_unchanged: bool,
}

impl ScanOptions {
    /// Options for walking `roots` with no exclusions
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            excluded_paths: Vec::new(),
            min_duration_ms: 0,
            follow_symlinks: false,
            skip_unchanged: false,
        }
    }

    /// Set excluded directory prefixes
    #[must_use]
    pub fn with_excluded_paths(mut self, excluded: Vec<PathBuf>) -> Self {
        self.excluded_paths = excluded;
        self
    }

    /// Set the minimum duration for persisted songs
    #[must_use]
    pub fn with_min_duration_ms(mut self, min_duration_ms: u64) -> Self {
        self.min_duration_ms = min_duration_ms;
        self
    }

    /// Descend into symlinked directories
    #[must_use]
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Skip files already indexed with the same (path, size, mtime)
    #[must_use]
    pub fn skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }
}

/// Lifecycle status of a scan
///
/// `Pending -> Running -> {Completed | Cancelled | Failed}`, with `Running`
/// and `Paused` alternating while the scan is live. `Unknown` is reported for
/// ids that were never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    /// Registered, run not started yet
    Pending,
    /// Walking and extracting
    Running,
    /// Walk suspended until resumed
    Paused,
    /// Walk finished and the final batch was flushed
    Completed,
    /// Stopped by the caller
    Cancelled,
    /// Stopped by an unrecoverable error
    Failed,
    /// Never seen by this coordinator
    #[default]
    Unknown,
}

impl ScanStatus {
    /// Convert to string for state files
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse from string
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the scan has stopped for good
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether a run is (or is about to be) in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    /// Whether moving from `self` to `next` is a legal transition
    #[must_use]
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        match (self, next) {
            (Pending, Running | Cancelled | Failed) => true,
            (Running, Paused | Completed | Cancelled | Failed) => true,
            // A pause requested after the last dequeue lets the run finish
            (Paused, Running | Completed | Cancelled | Failed) => true,
            // Resuming a stopped run from its persisted cursor
            (Cancelled | Failed, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Latest progress of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    /// Files taken off the walk and processed
    pub scanned_count: u64,

    /// Files whose metadata was extracted successfully (CUE tracks count individually)
    pub found_songs: u64,

    /// File processed most recently
    pub current_path: Option<PathBuf>,

    /// Unix epoch milliseconds of the last update
    pub last_updated: i64,

    /// Set once the run has stopped
    pub finished: bool,
}

impl ScanProgress {
    /// Fresh progress starting at `scanned_count`
    pub fn starting_at(scanned_count: u64) -> Self {
        Self {
            scanned_count,
            found_songs: 0,
            current_path: None,
            last_updated: super::now_millis(),
            finished: false,
        }
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::starting_at(0)
    }
}
