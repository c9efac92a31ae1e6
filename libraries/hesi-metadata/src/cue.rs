//! CUE sheet parsing
//!
//! A CUE sheet describes where tracks start inside one or more large audio
//! files. The parser is a line-oriented state machine over the directives
//! the scanner cares about (`FILE`, `PERFORMER`, `TITLE`, `TRACK`, `INDEX`);
//! `REM` and anything unrecognised is skipped.
//!
//! Parsing never fails. Malformed lines are recorded in
//! [`CueSheet::errors`] and the rest of the sheet is still read.

use crate::charset;
use crate::error::{MetadataError, Result};
use hesi_core::types::{CueSheet, CueTrackEntry};
use std::collections::BTreeMap;
use std::path::Path;

/// Red Book frames per second
pub const FRAMES_PER_SECOND: u64 = 75;

/// Parse raw sheet bytes, detecting their charset first
pub fn parse(bytes: &[u8]) -> CueSheet {
    parse_str(&charset::decode(bytes))
}

/// Read and parse a sheet from disk
pub fn parse_file(path: &Path) -> Result<CueSheet> {
    if !path.exists() {
        return Err(MetadataError::FileNotFound(path.display().to_string()));
    }
    let bytes = std::fs::read(path)?;
    Ok(parse(&bytes))
}

#[derive(Default)]
struct TrackBuilder {
    number: u32,
    title: Option<String>,
    performer: Option<String>,
    indexes: BTreeMap<u32, u64>,
    file: Option<String>,
}

impl TrackBuilder {
    fn build(self) -> CueTrackEntry {
        CueTrackEntry {
            track_number: self.number,
            title: self.title,
            performer: self.performer,
            indexes: self.indexes,
            file_reference: self.file,
        }
    }
}

/// Where TITLE and PERFORMER currently land
enum Scope {
    Album,
    Track(TrackBuilder),
    /// Inside a TRACK whose number could not be read; its lines are dropped
    Skipped,
}

struct Parser {
    sheet: CueSheet,
    current_file: Option<String>,
    scope: Scope,
}

impl Parser {
    fn new() -> Self {
        Self {
            sheet: CueSheet::default(),
            current_file: None,
            scope: Scope::Album,
        }
    }

    fn flush_track(&mut self) {
        if let Scope::Track(track) = std::mem::replace(&mut self.scope, Scope::Album) {
            if !track.indexes.contains_key(&hesi_core::types::CANONICAL_INDEX) {
                self.error(format!("track {} has no INDEX 01", track.number));
            }
            self.sheet.tracks.push(track.build());
        }
    }

    fn error(&mut self, message: String) {
        self.sheet.errors.push(message);
    }

    fn line(&mut self, line_no: usize, line: &str) {
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };

        match keyword.to_ascii_uppercase().as_str() {
            "FILE" => self.current_file = Some(file_name(rest)),
            "PERFORMER" => {
                let value = quoted_value(rest);
                match &mut self.scope {
                    Scope::Album => self.sheet.performer = Some(value),
                    Scope::Track(track) => track.performer = Some(value),
                    Scope::Skipped => {}
                }
            }
            "TITLE" => {
                let value = quoted_value(rest);
                match &mut self.scope {
                    Scope::Album => self.sheet.title = Some(value),
                    Scope::Track(track) => track.title = Some(value),
                    Scope::Skipped => {}
                }
            }
            "TRACK" => {
                self.flush_track();
                let token = rest.split_whitespace().next().unwrap_or("");
                self.scope = match token.parse::<u32>() {
                    Ok(number) => Scope::Track(TrackBuilder {
                        number,
                        file: self.current_file.clone(),
                        ..TrackBuilder::default()
                    }),
                    Err(_) => {
                        self.error(format!("line {line_no}: invalid track number '{token}'"));
                        Scope::Skipped
                    }
                };
            }
            "INDEX" => self.index(line_no, rest),
            _ => {}
        }
    }

    fn index(&mut self, line_no: usize, rest: &str) {
        let mut tokens = rest.split_whitespace();
        let number_token = tokens.next().unwrap_or("");
        let time_token = tokens.next().unwrap_or("");

        let Ok(number) = number_token.parse::<u32>() else {
            self.error(format!("line {line_no}: invalid index number '{number_token}'"));
            return;
        };

        let offset = parse_time(time_token).unwrap_or_else(|| {
            self.error(format!("line {line_no}: malformed time '{time_token}'"));
            0
        });

        match &mut self.scope {
            Scope::Track(track) => {
                track.indexes.insert(number, offset);
            }
            Scope::Album => self.error(format!("line {line_no}: INDEX outside of a TRACK")),
            Scope::Skipped => {}
        }
    }

    fn finish(mut self) -> CueSheet {
        self.flush_track();
        self.sheet
    }
}

/// Parse already-decoded sheet text
pub fn parse_str(text: &str) -> CueSheet {
    let mut parser = Parser::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() {
            continue;
        }
        parser.line(i + 1, line);
    }

    let sheet = parser.finish();
    if !sheet.errors.is_empty() {
        tracing::debug!("CUE sheet parsed with {} anomalies", sheet.errors.len());
    }
    sheet
}

/// Value between the first and last double quote, else the whole remainder
fn quoted_value(rest: &str) -> String {
    match (rest.find('"'), rest.rfind('"')) {
        (Some(first), Some(last)) if first < last => rest[first + 1..last].to_string(),
        _ => rest.trim_matches('"').trim().to_string(),
    }
}

/// FILE value without the trailing type token (`WAVE`, `MP3`, ...)
fn file_name(rest: &str) -> String {
    if rest.contains('"') {
        return quoted_value(rest);
    }
    match rest.rsplit_once(char::is_whitespace) {
        Some((name, _kind)) => name.trim().to_string(),
        None => rest.to_string(),
    }
}

fn split_time(token: &str) -> Option<(u64, u64, u64)> {
    let mut parts = token.split(':');
    let minutes = parts.next()?.parse::<u64>().ok()?;
    let seconds = parts.next()?.parse::<u64>().ok()?;
    let frames = parts.next()?.parse::<u64>().ok()?;
    if parts.next().is_some() || seconds >= 60 || frames >= FRAMES_PER_SECOND {
        return None;
    }
    Some((minutes, seconds, frames))
}

/// `mm:ss:ff` to milliseconds, frames rounded to the nearest millisecond
///
/// `None` for anything that is not three numeric fields with seconds below
/// 60 and frames below 75.
pub fn parse_time(token: &str) -> Option<u64> {
    let (minutes, seconds, frames) = split_time(token)?;
    let frame_ms = (frames * 1000 + FRAMES_PER_SECOND / 2) / FRAMES_PER_SECOND;
    to_millis(minutes, seconds, frame_ms)
}

/// Like [`parse_time`] but truncating the frame fraction
pub fn parse_time_floor(token: &str) -> Option<u64> {
    let (minutes, seconds, frames) = split_time(token)?;
    to_millis(minutes, seconds, frames * 1000 / FRAMES_PER_SECOND)
}

/// `None` when the minutes field is too large to represent
fn to_millis(minutes: u64, seconds: u64, frame_ms: u64) -> Option<u64> {
    minutes
        .checked_mul(60_000)?
        .checked_add(seconds * 1000 + frame_ms)
}

/// Effective span of one track inside its physical file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSpan {
    /// TRACK number
    pub track_number: u32,
    /// INDEX 01 offset
    pub start_ms: u64,
    /// Next track's INDEX 01; `None` means until the end of the file
    pub end_ms: Option<u64>,
}

impl TrackSpan {
    /// Duration, resolving an open end against the file's total duration
    pub fn duration_ms(&self, file_duration_ms: Option<u64>) -> Option<u64> {
        self.end_ms
            .or(file_duration_ms)
            .map(|end| end.saturating_sub(self.start_ms))
    }
}

/// Boundaries for tracks that share one physical file
///
/// Tracks without an INDEX 01 have no start and are left out. A next start
/// earlier than the current one (a broken sheet) is clamped so spans never
/// run backwards.
pub fn track_boundaries<'a, I>(tracks: I) -> Vec<TrackSpan>
where
    I: IntoIterator<Item = &'a CueTrackEntry>,
{
    let starts: Vec<(u32, u64)> = tracks
        .into_iter()
        .filter_map(|t| t.start_ms().map(|start| (t.track_number, start)))
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, &(track_number, start_ms))| TrackSpan {
            track_number,
            start_ms,
            end_ms: starts.get(i + 1).map(|&(_, next)| next.max(start_ms)),
        })
        .collect()
}
