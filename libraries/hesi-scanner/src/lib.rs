//! HesiMusic Scanner
//!
//! Incremental, resumable library scanning.
//!
//! A scan walks its roots breadth-first, extracts metadata from every audio
//! file it meets (expanding CUE sheets into virtual tracks), and hands records
//! to a [`SongSink`](hesi_core::SongSink) in batches. After every batch the
//! exact walk frontier is checkpointed, so an interrupted scan can pick up
//! where it stopped.
//!
//! # Example
//!
//! ```rust,no_run
//! use hesi_core::{ScanOptions, SongRecord, SongSink};
//! use hesi_metadata::LoftyExtractor;
//! use hesi_scanner::{CoordinatorConfig, ScanCoordinator};
//! use std::sync::Arc;
//!
//! struct Discard;
//!
//! #[async_trait::async_trait]
//! impl SongSink for Discard {
//!     async fn save_batch(&self, _records: &[SongRecord]) -> hesi_core::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> hesi_scanner::Result<()> {
//! let coordinator = ScanCoordinator::new(
//!     CoordinatorConfig::new("/var/lib/hesi"),
//!     Arc::new(LoftyExtractor::new()),
//!     Arc::new(Discard),
//! );
//!
//! let scan_id = coordinator.start_scan(ScanOptions::new(vec!["/music".into()]))?;
//! let status = coordinator.wait_for(&scan_id).await;
//! println!("{scan_id}: {status}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod errors;
mod run;
pub mod state_store;
pub mod walker;

pub use coordinator::{CoordinatorConfig, ProgressCallback, ScanCoordinator, DEFAULT_BATCH_SIZE};
pub use dedup::{compute_fingerprint, fingerprint_file, Deduplicator, DuplicateCheck, QuickKey};
pub use error::{Result, ScanError};
pub use errors::{ErrorAggregator, ErrorCallback, DEFAULT_ERROR_DEBOUNCE};
pub use state_store::{Checkpoint, ScanState, StateStore};
pub use walker::{is_excluded, Walk, WalkControl, Walker, DEFAULT_LISTING_PERMITS};
