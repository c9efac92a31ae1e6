//! Duplicate detection
//!
//! Uses `(path, size, mtime)` as a cheap identity. Content fingerprints are a
//! separate, opt-in signal computed off the async threads.

use crate::error::Result;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Cheap file identity used for duplicate suspicion
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuickKey {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Modification time, Unix epoch milliseconds
    pub modified_ms: i64,
}

impl QuickKey {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64, modified_ms: i64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            modified_ms,
        }
    }

    /// Build the key from filesystem metadata
    pub fn from_metadata(path: &Path, metadata: &std::fs::Metadata) -> Self {
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self::new(path, metadata.len(), modified_ms)
    }

    /// Stat `path` and build its key
    pub async fn for_path(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(path, &metadata))
    }
}

/// Outcome of a duplicate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    /// Id of the entry the candidate duplicates
    pub duplicate_of: Option<String>,
}

/// Process-lifetime quick-key index
///
/// Unbounded; entries are never evicted.
#[derive(Debug, Default)]
pub struct Deduplicator {
    index: DashMap<QuickKey, String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `key` is stored under `id`
    pub fn index_existing(&self, key: QuickKey, id: impl Into<String>) {
        self.index.insert(key, id.into());
    }

    pub fn is_duplicate(&self, candidate: &QuickKey) -> DuplicateCheck {
        let duplicate_of = self.index.get(candidate).map(|id| id.clone());
        DuplicateCheck {
            is_duplicate: duplicate_of.is_some(),
            duplicate_of,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// SHA-256 of a file's full content, hex encoded
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};
    use std::fs::File;
    use std::io::Read;

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// [`fingerprint_file`] on the blocking pool
pub async fn compute_fingerprint(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || fingerprint_file(&path)).await??;
    Ok(digest)
}
