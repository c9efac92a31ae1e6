//! HesiMusic Core
//!
//! Shared types, traits, and error handling for the HesiMusic library scanner.
//!
//! This crate has no filesystem or runtime dependencies of its own; it defines
//! the vocabulary the other crates speak.
//!
//! # Architecture
//!
//! The core crate defines:
//! - **Domain Types**: `ScanOptions`, `ScanCursor`, `ScanProgress`, `SongRecord`, ...
//! - **Core Traits**: `MetadataExtractor`, `SongSink`
//! - **Error Handling**: Unified `HesiError` and `Result` types
//!
//! # Example
//!
//! ```rust
//! use hesi_core::types::{ScanCursor, ScanOptions};
//! use std::path::PathBuf;
//!
//! let options = ScanOptions::new(vec![PathBuf::from("/music")])
//!     .with_excluded_paths(vec![PathBuf::from("/music/podcasts")]);
//!
//! let cursor = ScanCursor::new(vec![PathBuf::from("/music/a")], 12);
//! let restored = ScanCursor::deserialize(&cursor.serialize());
//! assert_eq!(cursor, restored);
//! # let _ = options;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{HesiError, Result};
pub use traits::{MetadataExtractor, SongSink};

pub use types::{
    // Scan lifecycle
    ScanId, ScanOptions, ScanProgress, ScanStatus,
    // Traversal
    ScanCursor,
    // Records
    MetadataResult, SongRecord,
    // CUE
    CueSheet, CueTrackEntry,
    // Errors
    ErrorSummary, GLOBAL_ERROR_KEY, MAX_ERROR_SAMPLES,
};
