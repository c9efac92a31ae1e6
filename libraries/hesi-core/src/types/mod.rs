mod cue;
mod cursor;
mod error_summary;
mod scan;
mod song;

pub use cue::{CueSheet, CueTrackEntry, CANONICAL_INDEX};
pub use cursor::ScanCursor;
pub use error_summary::{ErrorSummary, GLOBAL_ERROR_KEY, MAX_ERROR_SAMPLES};
pub use scan::{ScanId, ScanOptions, ScanProgress, ScanStatus};
pub use song::{MetadataResult, SongRecord};

/// Current wall-clock time as Unix epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
