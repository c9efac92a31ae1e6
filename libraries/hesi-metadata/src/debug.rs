//! Tag debugging for mojibake reports
//!
//! Shows, for the basic text fields of one file, the raw bytes the text most
//! likely came from and what those bytes look like under each candidate
//! charset. Used by hosts to diagnose badly encoded legacy tags.

use crate::charset::{self, SingleByte, DEFAULT_CANDIDATES};
use lofty::{Accessor, Probe, TaggedFileExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Analysis of one tag field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDebugInfo {
    /// Field name (`TITLE`, `ARTIST`, `ALBUM`)
    pub field_name: String,
    /// Text as the tag library returned it
    pub original_value: String,
    /// Bytes recovered by re-encoding as Latin-1, hex dumped
    pub raw_bytes_hex: String,
    /// Charset the detector picks for the recovered bytes
    pub detected_charset: Option<String>,
    /// Recovered bytes decoded under each candidate charset
    pub decoded_candidates: BTreeMap<String, String>,
}

/// Result of debugging one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugReport {
    pub file_path: PathBuf,
    pub fields: Vec<FieldDebugInfo>,
    pub error: Option<String>,
}

impl DebugReport {
    fn failed(path: &Path, error: impl Into<String>) -> Self {
        Self {
            file_path: path.to_path_buf(),
            fields: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Charset debugger for tag text
#[derive(Debug, Clone, Copy, Default)]
pub struct TagDebugger;

impl TagDebugger {
    pub fn new() -> Self {
        Self
    }

    /// Inspect the title, artist and album of `path`
    pub fn debug(&self, path: &Path) -> DebugReport {
        tracing::debug!("Debugging tags of {}", path.display());

        if !path.exists() {
            return DebugReport::failed(path, "File not found");
        }

        let tagged_file = match Probe::open(path).and_then(|probe| probe.read()) {
            Ok(file) => file,
            Err(e) => return DebugReport::failed(path, e.to_string()),
        };

        let Some(tag) = tagged_file.primary_tag().or(tagged_file.first_tag()) else {
            return DebugReport::failed(path, "No tag found or file unreadable");
        };

        let fields = [
            ("TITLE", tag.title()),
            ("ARTIST", tag.artist()),
            ("ALBUM", tag.album()),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value?;
            (!value.is_empty()).then(|| self.analyze_field(name, &value))
        })
        .collect::<Vec<_>>();

        for info in &fields {
            tracing::debug!(
                field = %info.field_name,
                original = %info.original_value,
                hex = %info.raw_bytes_hex,
                detected = ?info.detected_charset,
                "Tag field analysis"
            );
        }

        DebugReport {
            file_path: path.to_path_buf(),
            fields,
            error: None,
        }
    }

    /// Analyse one value assuming it was mis-decoded as Latin-1
    ///
    /// Characters outside Latin-1 cannot have come from that mistake; the
    /// recovery then falls back to windows-1252, and failing that to the
    /// value's UTF-8 bytes.
    pub fn analyze_field(&self, field_name: &str, original_value: &str) -> FieldDebugInfo {
        let via = if charset::recover_bytes(original_value, SingleByte::Latin1).is_some() {
            Some(SingleByte::Latin1)
        } else if charset::recover_bytes(original_value, SingleByte::Windows1252).is_some() {
            Some(SingleByte::Windows1252)
        } else {
            None
        };

        let raw_bytes = via
            .and_then(|via| charset::recover_bytes(original_value, via))
            .unwrap_or_else(|| original_value.as_bytes().to_vec());

        let decoded_candidates = match via {
            Some(via) => charset::mojibake_candidates(original_value, via, DEFAULT_CANDIDATES),
            None => charset::decode_candidates(&raw_bytes, DEFAULT_CANDIDATES),
        };

        FieldDebugInfo {
            field_name: field_name.to_string(),
            original_value: original_value.to_string(),
            raw_bytes_hex: charset::hex_dump(&raw_bytes),
            detected_charset: (!raw_bytes.is_empty())
                .then(|| charset::detect(&raw_bytes).to_string()),
            decoded_candidates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reports_error() {
        let report = TagDebugger::new().debug(Path::new("/nonexistent/song.mp3"));
        assert_eq!(report.error.as_deref(), Some("File not found"));
        assert!(report.fields.is_empty());
    }

    #[test]
    fn analyze_latin1_mojibake() {
        // "中文" in GBK, read back as Latin-1
        let garbled: String = [0xD6u8, 0xD0, 0xCE, 0xC4].iter().map(|&b| char::from(b)).collect();
        let info = TagDebugger::new().analyze_field("TITLE", &garbled);

        assert_eq!(info.raw_bytes_hex, "D6 D0 CE C4");
        assert_eq!(info.decoded_candidates["GBK"], "中文");
        assert_eq!(info.decoded_candidates.len(), DEFAULT_CANDIDATES.len());
        assert!(info.detected_charset.is_some());
    }

    #[test]
    fn analyze_clean_unicode_uses_utf8_bytes() {
        let info = TagDebugger::new().analyze_field("ARTIST", "周杰伦");
        assert_eq!(info.decoded_candidates["UTF-8"], "周杰伦");
        assert_eq!(info.detected_charset.as_deref(), Some("UTF-8"));
    }
}
