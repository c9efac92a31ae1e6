/// Metadata extraction using lofty
use crate::charset;
use crate::error::{MetadataError, Result};
use hesi_core::{MetadataExtractor, MetadataResult};
use lofty::{Accessor, AudioFile, ItemKey, Probe, TaggedFileExt};
use std::path::Path;
use std::sync::Arc;

/// Extensions the scanner treats as audio
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "wav", "m4a", "aac", "ogg", "opus", "ape", "wv", "aiff",
];

/// Extension of CUE sheets
pub const CUE_EXTENSION: &str = "cue";

/// Receives per-file extraction failures as `(path, message)`
pub type ErrorSink = Arc<dyn Fn(&Path, &str) + Send + Sync>;

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Check if a file has a supported audio extension
pub fn is_audio_file(path: &Path) -> bool {
    lowercase_extension(path).is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

/// Check if a file is a CUE sheet
pub fn is_cue_file(path: &Path) -> bool {
    lowercase_extension(path).is_some_and(|ext| ext == CUE_EXTENSION)
}

/// Metadata extractor backed by lofty
///
/// Never fails: unreadable files come back as [`MetadataResult::failed`] and
/// the reason goes to the optional error sink.
#[derive(Clone)]
pub struct LoftyExtractor {
    error_sink: Option<ErrorSink>,
    repair_charset: bool,
}

impl Default for LoftyExtractor {
    fn default() -> Self {
        Self {
            error_sink: None,
            repair_charset: true,
        }
    }
}

impl LoftyExtractor {
    /// Create a new extractor
    pub fn new() -> Self {
        Self::default()
    }

    /// Report extraction failures to `sink`
    #[must_use]
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Re-decode tag text that looks like mis-decoded legacy charsets
    #[must_use]
    pub fn repair_charset(mut self, repair: bool) -> Self {
        self.repair_charset = repair;
        self
    }

    fn text(&self, value: Option<String>) -> Option<String> {
        let value = value?.trim().to_string();
        if value.is_empty() {
            return None;
        }
        if self.repair_charset {
            if let Some(repaired) = charset::repair_tag_text(&value) {
                tracing::debug!("Repaired tag text {:?} -> {:?}", value, repaired);
                return Some(repaired);
            }
        }
        Some(value)
    }

    /// Read everything lofty can tell us about `path`
    pub fn read(&self, path: &Path) -> Result<MetadataResult> {
        if !path.exists() {
            return Err(MetadataError::FileNotFound(path.display().to_string()));
        }
        let size_bytes = std::fs::metadata(path)?.len();

        let tagged_file = Probe::open(path)?.read()?;
        let properties = tagged_file.properties();
        let tag = tagged_file.primary_tag().or(tagged_file.first_tag());

        let (title, artist, album, tags_json) = match tag {
            Some(tag) => (
                self.text(tag.title().map(|s| s.to_string())),
                self.text(tag.artist().map(|s| s.to_string())),
                self.text(tag.album().map(|s| s.to_string())),
                Some(tags_to_json(tag)),
            ),
            None => (None, None, None, None),
        };

        // Fallback: use the file name when the tags carry no title
        let title = title.or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string())
        });

        let format = lowercase_extension(path).map(|ext| format!("audio/{ext}"));

        Ok(MetadataResult {
            duration_ms: properties.duration().as_millis() as u64,
            title,
            artist,
            album,
            bitrate: properties
                .audio_bitrate()
                .or_else(|| properties.overall_bitrate()),
            sample_rate: properties.sample_rate(),
            channels: properties.channels(),
            format,
            size_bytes,
            success: true,
            tags_json,
        })
    }
}

/// Flat `{key: text}` dump of every text item in a tag
fn tags_to_json(tag: &lofty::Tag) -> String {
    let mut map = serde_json::Map::new();
    for item in tag.items() {
        let Some(text) = item.value().text() else {
            continue;
        };
        let key = match item.key() {
            ItemKey::Unknown(raw) => raw.clone(),
            known => format!("{known:?}"),
        };
        map.entry(key)
            .or_insert_with(|| serde_json::Value::String(text.to_string()));
    }
    serde_json::Value::Object(map).to_string()
}

impl MetadataExtractor for LoftyExtractor {
    fn extract(&self, path: &Path) -> MetadataResult {
        match self.read(path) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Failed to extract metadata from {}: {}", path.display(), e);
                if let Some(sink) = &self.error_sink {
                    sink(path, &format!("metadata extraction failed: {e}"));
                }
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                MetadataResult::failed(size)
            }
        }
    }
}
