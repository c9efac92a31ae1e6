//! CUE sheet types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// INDEX number carrying a track's canonical start offset
pub const CANONICAL_INDEX: u32 = 1;

/// One TRACK block of a CUE sheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CueTrackEntry {
    /// Number from the TRACK directive
    pub track_number: u32,

    /// Track-scope TITLE
    pub title: Option<String>,

    /// Track-scope PERFORMER
    pub performer: Option<String>,

    /// INDEX number -> offset in milliseconds
    pub indexes: BTreeMap<u32, u64>,

    /// FILE in effect when the track was declared
    pub file_reference: Option<String>,
}

impl CueTrackEntry {
    /// Start offset (INDEX 01), if present
    pub fn start_ms(&self) -> Option<u64> {
        self.indexes.get(&CANONICAL_INDEX).copied()
    }
}

/// Parsed CUE sheet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CueSheet {
    /// Album-scope TITLE (before the first TRACK)
    pub title: Option<String>,

    /// Album-scope PERFORMER (before the first TRACK)
    pub performer: Option<String>,

    /// Tracks in file order
    pub tracks: Vec<CueTrackEntry>,

    /// Anomalies found while parsing
    pub errors: Vec<String>,
}

impl CueSheet {
    /// Tracks grouped by FILE reference, in order of first appearance
    pub fn tracks_by_file(&self) -> Vec<(Option<&str>, Vec<&CueTrackEntry>)> {
        let mut groups: Vec<(Option<&str>, Vec<&CueTrackEntry>)> = Vec::new();
        for track in &self.tracks {
            let file = track.file_reference.as_deref();
            match groups.iter_mut().find(|(f, _)| *f == file) {
                Some((_, tracks)) => tracks.push(track),
                None => groups.push((file, vec![track])),
            }
        }
        groups
    }
}
