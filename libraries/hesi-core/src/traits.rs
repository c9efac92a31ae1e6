/// Core traits for HesiMusic
use crate::error::Result;
use crate::types::{MetadataResult, SongRecord};
use async_trait::async_trait;
use std::path::Path;

/// Metadata extraction boundary
///
/// Implementers read duration, basic tags, and stream properties from a
/// single audio file. Extraction never fails: an unreadable file yields a
/// result with `success == false` and zeroed fields, so the scanner can still
/// record the file.
///
/// Extraction is blocking; callers on an async runtime should move it onto a
/// blocking thread.
pub trait MetadataExtractor: Send + Sync {
    /// Extract metadata from the file at `path`
    fn extract(&self, path: &Path) -> MetadataResult;
}

/// Persistence sink for scanned songs
///
/// `save_batch` is an idempotent upsert keyed by [`SongRecord::id`]: saving the
/// same record twice leaves one row, and a later save replaces the earlier one
/// wholesale.
#[async_trait]
pub trait SongSink: Send + Sync {
    /// Persist a batch of records
    ///
    /// # Errors
    /// Returns an error if the batch could not be written. The scanner treats
    /// this as fatal for the running scan.
    async fn save_batch(&self, records: &[SongRecord]) -> Result<()>;
}
