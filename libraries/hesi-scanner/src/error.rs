//! Error types for the scanner

use hesi_core::{ScanId, ScanStatus};
use thiserror::Error;

/// Result type alias using `ScanError`
pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Scan coordinator used outside of a tokio runtime")]
    NotInitialized,

    #[error("Unknown scan: {0}")]
    UnknownScan(ScanId),

    #[error("Scan {scan_id} is {status}")]
    InvalidState { scan_id: ScanId, status: ScanStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence sink error: {0}")]
    Sink(#[from] hesi_core::HesiError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ScanError> for hesi_core::HesiError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::UnknownScan(id) => hesi_core::HesiError::not_found("scan", id.as_str()),
            ScanError::Io(e) => hesi_core::HesiError::Io(e),
            ScanError::Serialization(e) => hesi_core::HesiError::Serialization(e),
            ScanError::Sink(e) => e,
            other => hesi_core::HesiError::Other(other.to_string()),
        }
    }
}
