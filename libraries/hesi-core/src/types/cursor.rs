//! Serializable BFS frontier used to resume an interrupted walk

use std::path::PathBuf;

/// Snapshot of a walk's pending queue
///
/// `pending_paths` is a FIFO queue: order matters and is preserved by the
/// text encoding.
///
/// The encoding is line oriented: the first line holds `processed_count`,
/// every following line one pending path. Newlines inside a path are replaced
/// by spaces, so such paths do not survive a round trip; non UTF-8 path bytes
/// are replaced lossily for the same reason.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanCursor {
    /// Paths still to be dequeued, front first
    pub pending_paths: Vec<PathBuf>,

    /// Files already handed to the file callback
    pub processed_count: u64,
}

impl ScanCursor {
    /// Create a cursor
    pub fn new(pending_paths: Vec<PathBuf>, processed_count: u64) -> Self {
        Self {
            pending_paths,
            processed_count,
        }
    }

    /// Whether nothing is left to walk
    pub fn is_exhausted(&self) -> bool {
        self.pending_paths.is_empty()
    }

    /// Encode into the line-oriented text format
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.processed_count.to_string());
        out.push('\n');
        for path in &self.pending_paths {
            out.push_str(&path.to_string_lossy().replace('\n', " "));
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Decode the line-oriented text format
    ///
    /// Total for any input: an unparsable count reads as 0 and blank lines
    /// are dropped.
    pub fn deserialize(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = text.split('\n');

        let processed_count = lines
            .next()
            .and_then(|line| line.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let pending_paths = lines
            .filter(|line| !line.trim().is_empty())
            .map(PathBuf::from)
            .collect();

        Self {
            pending_paths,
            processed_count,
        }
    }
}
