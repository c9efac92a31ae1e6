//! Persisted song records and extraction results

use serde::{Deserialize, Serialize};

/// One persisted library entry
///
/// `id` is the physical path for ordinary files and `"<path>#<start_ms>"` for
/// virtual tracks cut from a CUE sheet. Records are replaced wholesale on
/// rescan, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongRecord {
    /// Upsert key
    pub id: String,

    /// Physical audio file
    pub path: String,

    /// CUE context for virtual tracks (JSON)
    pub cue_blob: Option<String>,

    /// Track title
    pub title: Option<String>,

    /// Artist name
    pub artist: Option<String>,

    /// Album title
    pub album: Option<String>,

    /// Duration in milliseconds (0 when unknown)
    pub duration_ms: u64,

    /// Size of the physical file in bytes
    pub size_bytes: u64,

    /// Container / MIME-like format (e.g. "audio/flac")
    pub format: Option<String>,

    /// Bitrate in kbps
    pub bitrate: Option<u32>,

    /// Sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Channel count
    pub channels: Option<u8>,

    /// Flat tag dump (JSON object)
    pub tags_json: Option<String>,

    /// Content digest, when computed
    pub fingerprint: Option<String>,

    /// Unix epoch milliseconds of the scan that produced this record
    pub last_scanned_at: i64,
}

impl SongRecord {
    /// Id for a CUE-derived virtual track
    pub fn virtual_track_id(path: &str, start_ms: u64) -> String {
        format!("{path}#{start_ms}")
    }

    /// Whether this record was cut from a CUE sheet
    pub fn is_virtual(&self) -> bool {
        self.cue_blob.is_some()
    }
}

/// Result of the metadata extraction boundary
///
/// Extraction never fails outright; `success == false` marks a file whose
/// tags and properties could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResult {
    /// Duration in milliseconds
    pub duration_ms: u64,

    /// Track title
    pub title: Option<String>,

    /// Artist name
    pub artist: Option<String>,

    /// Album title
    pub album: Option<String>,

    /// Bitrate in kbps
    pub bitrate: Option<u32>,

    /// Sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Channel count
    pub channels: Option<u8>,

    /// Container / MIME-like format
    pub format: Option<String>,

    /// File size in bytes
    pub size_bytes: u64,

    /// Whether the file could be read at all
    pub success: bool,

    /// Flat tag dump (JSON object)
    pub tags_json: Option<String>,
}

impl MetadataResult {
    /// Best-effort result for a file that could not be read
    pub fn failed(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            ..Self::default()
        }
    }
}
