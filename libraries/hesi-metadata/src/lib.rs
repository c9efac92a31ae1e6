//! HesiMusic Metadata
//!
//! Everything that turns raw bytes into text and tags for the scanner.
//!
//! This crate provides:
//! - CUE sheet parsing into ordered track descriptors
//! - Charset detection and mojibake recovery for legacy tag text
//! - A lofty-backed [`MetadataExtractor`](hesi_core::MetadataExtractor)
//! - A tag debugger that lists candidate decodings per field
//!
//! # Example
//!
//! ```rust
//! use hesi_metadata::cue;
//!
//! let sheet = cue::parse(b"FILE \"album.flac\" WAVE\n  TRACK 01 AUDIO\n    INDEX 01 00:00:00\n");
//! assert_eq!(sheet.tracks.len(), 1);
//! assert_eq!(sheet.tracks[0].file_reference.as_deref(), Some("album.flac"));
//! ```

pub mod charset;
pub mod cue;
mod debug;
mod error;
mod reader;

pub use debug::{DebugReport, FieldDebugInfo, TagDebugger};
pub use error::{MetadataError, Result};
pub use reader::{
    is_audio_file, is_cue_file, ErrorSink, LoftyExtractor, AUDIO_EXTENSIONS, CUE_EXTENSION,
};
