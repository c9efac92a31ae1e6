//! One execution of a scan
//!
//! Files come off the walk grouped by directory. A group is processed once
//! the walk moves past it: CUE sheets first, so the audio files they cut into
//! virtual tracks are known before the plain files are handled.
//!
//! Checkpoints are conservative. The cursor written at a flush replays the
//! whole current group, so a resumed run may re-upsert a few records but
//! never misses one.

use crate::coordinator::Shared;
use crate::dedup::{compute_fingerprint, QuickKey};
use crate::error::Result;
use crate::state_store::Checkpoint;
use crate::walker::{Walk, WalkControl};
use hesi_core::types::now_millis;
use hesi_core::{
    CueTrackEntry, MetadataResult, ScanCursor, ScanId, ScanOptions, ScanProgress, SongRecord,
};
use hesi_metadata::{cue, is_audio_file, is_cue_file, AUDIO_EXTENSIONS};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a run ended without a fatal error
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Walk exhausted; carries the final checkpoint write failure, if any
    Completed { checkpoint_error: Option<String> },
    /// Stopped through the run's cancellation token
    Cancelled,
}

pub(crate) struct ScanRun {
    shared: Arc<Shared>,
    scan_id: ScanId,
    options: ScanOptions,
    walk: Walk,
    progress: ScanProgress,
    batch: Vec<SongRecord>,
    /// Dequeued files of the current directory, not yet processed
    group: Vec<PathBuf>,
    group_dir: Option<PathBuf>,
    /// File that closed the current group; dequeued but not yet grouped
    in_hand: Option<PathBuf>,
    /// Songs found so far inside the current group
    group_found: u64,
    /// Files handled by this run (overlapping roots reach some twice)
    seen: HashSet<PathBuf>,
    /// Audio files already cut into tracks by a CUE sheet
    consumed: HashSet<PathBuf>,
}

impl ScanRun {
    pub(crate) fn new(
        shared: Arc<Shared>,
        scan_id: ScanId,
        options: ScanOptions,
        cursor: Option<ScanCursor>,
        progress: ScanProgress,
        control: &WalkControl,
    ) -> Self {
        let walk = shared.walker.walk(
            &options.roots,
            &options,
            cursor,
            control,
            Some(scan_id.clone()),
        );

        Self {
            shared,
            scan_id,
            options,
            walk,
            progress,
            batch: Vec::new(),
            group: Vec::new(),
            group_dir: None,
            in_hand: None,
            group_found: 0,
            seen: HashSet::new(),
            consumed: HashSet::new(),
        }
    }

    pub(crate) async fn execute(mut self) -> Result<RunOutcome> {
        info!(
            "Scan {} running from {} processed file(s)",
            self.scan_id, self.progress.scanned_count
        );

        while let Some(path) = self.walk.next_file().await {
            let dir = path.parent().map(Path::to_path_buf);
            if dir != self.group_dir && !self.group.is_empty() {
                self.in_hand = Some(path.clone());
                let interrupted = self.process_group().await?;
                self.in_hand = None;
                if interrupted {
                    self.flush().await?;
                    return Ok(RunOutcome::Cancelled);
                }
            }
            self.group_dir = dir;
            self.group.push(path);
        }

        if self.walk.is_cancelled() || self.process_group().await? {
            self.flush().await?;
            return Ok(RunOutcome::Cancelled);
        }

        let checkpoint_error = self.flush().await?;
        info!(
            "Scan {} walked {} file(s), found {} song(s)",
            self.scan_id, self.progress.scanned_count, self.progress.found_songs
        );
        Ok(RunOutcome::Completed { checkpoint_error })
    }

    /// Process the buffered group; `true` if cancellation interrupted it
    async fn process_group(&mut self) -> Result<bool> {
        let (cues, others): (Vec<PathBuf>, Vec<PathBuf>) =
            self.group.iter().cloned().partition(|path| is_cue_file(path));

        for path in cues.into_iter().chain(others) {
            if self.walk.is_cancelled() {
                return Ok(true);
            }

            if self.seen.insert(path.clone()) {
                if is_cue_file(&path) {
                    self.process_cue(&path).await;
                } else if self.consumed.contains(&path) {
                    debug!("{} is covered by a CUE sheet", path.display());
                } else if is_audio_file(&path) {
                    self.process_audio(&path).await;
                }
            }

            self.file_done(path).await?;
        }

        self.group.clear();
        self.group_found = 0;
        Ok(false)
    }

    async fn file_done(&mut self, path: PathBuf) -> Result<()> {
        self.progress.scanned_count += 1;
        self.progress.current_path = Some(path);
        self.progress.last_updated = now_millis();
        self.publish_progress().await;

        if self.batch.len() >= self.shared.config.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn publish_progress(&self) {
        let snapshot = self.progress.clone();
        self.shared
            .progress
            .insert(self.scan_id.clone(), snapshot.clone());
        if let Some(callback) = self.shared.progress_callback() {
            callback(&self.scan_id, &snapshot);
        }

        let store = Arc::clone(&self.shared.store);
        let scan_id = self.scan_id.clone();
        let written =
            tokio::task::spawn_blocking(move || store.write_progress(&scan_id, &snapshot)).await;
        let failure = match written {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!("Failed to persist progress of scan {}: {}", self.scan_id, failure);
        self.report(format!("failed to persist progress: {failure}"));
    }

    /// Persist the batch, then checkpoint the frontier
    ///
    /// A sink failure is fatal. A checkpoint failure is reported and returned.
    async fn flush(&mut self) -> Result<Option<String>> {
        if !self.batch.is_empty() {
            let batch = std::mem::take(&mut self.batch);
            self.shared.sink.save_batch(&batch).await?;
            debug!("Scan {} saved {} record(s)", self.scan_id, batch.len());
        }

        let replay = self.group.len() as u64 + u64::from(self.in_hand.is_some());
        let pending: Vec<PathBuf> = self
            .group
            .iter()
            .chain(self.in_hand.iter())
            .chain(self.walk.pending())
            .cloned()
            .collect();
        let cursor = ScanCursor::new(pending, self.walk.processed_count().saturating_sub(replay));
        let checkpoint = Checkpoint {
            last_path: self.progress.current_path.clone(),
            processed_count: cursor.processed_count,
            found_songs: self.progress.found_songs.saturating_sub(self.group_found),
            updated_at: now_millis(),
        };

        let store = Arc::clone(&self.shared.store);
        let scan_id = self.scan_id.clone();
        let written = tokio::task::spawn_blocking(move || {
            store.write_checkpoint(&scan_id, &checkpoint, &cursor)
        })
        .await;
        let failure = match written {
            Ok(Ok(())) => return Ok(None),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!("Failed to write checkpoint for scan {}: {}", self.scan_id, failure);
        self.report(format!("failed to write checkpoint: {failure}"));
        Ok(Some(failure))
    }

    async fn process_audio(&mut self, path: &Path) {
        let Some(key) = self.quick_key(path).await else {
            return;
        };
        if self.is_unchanged(&key) {
            return;
        }

        let meta = self.extract(path).await;
        let fingerprint = self.fingerprint(path).await;
        if meta.success {
            self.progress.found_songs += 1;
            self.group_found += 1;
        }

        let mut record = self.base_record(path, &meta, fingerprint);
        record.duration_ms = meta.duration_ms;
        record.title = meta.title.clone().or_else(|| file_stem(path));
        record.artist = meta.artist.clone();
        record.album = meta.album.clone();

        self.shared.dedup.index_existing(key, record.id.clone());
        self.push(record);
    }

    async fn process_cue(&mut self, cue_path: &Path) {
        let owned = cue_path.to_path_buf();
        let sheet = match tokio::task::spawn_blocking(move || cue::parse_file(&owned)).await {
            Ok(Ok(sheet)) => sheet,
            Ok(Err(e)) => {
                self.report(format!("{}: {}", cue_path.display(), e));
                return;
            }
            Err(e) => {
                self.report(format!("{}: CUE parsing aborted: {}", cue_path.display(), e));
                return;
            }
        };

        for anomaly in &sheet.errors {
            self.report(format!("{}: {}", cue_path.display(), anomaly));
        }

        let dir = cue_path.parent().unwrap_or_else(|| Path::new("."));
        for (reference, tracks) in sheet.tracks_by_file() {
            let Some(reference) = reference else {
                self.report(format!(
                    "{}: {} track(s) without a FILE line",
                    cue_path.display(),
                    tracks.len()
                ));
                continue;
            };
            let Some(audio) = resolve_reference(dir, reference).await else {
                self.report(format!(
                    "{}: referenced file {} not found",
                    cue_path.display(),
                    reference
                ));
                continue;
            };
            if self.consumed.contains(&audio) {
                self.report(format!(
                    "{}: {} is already split by another CUE sheet",
                    cue_path.display(),
                    audio.display()
                ));
                continue;
            }
            if self.seen.contains(&audio) {
                // Walked in an earlier directory and already stored whole
                self.report(format!(
                    "{}: {} was already scanned as a standalone file",
                    cue_path.display(),
                    audio.display()
                ));
                continue;
            }
            self.consumed.insert(audio.clone());

            let Some(key) = self.quick_key(&audio).await else {
                continue;
            };
            if self.is_unchanged(&key) {
                continue;
            }

            let meta = self.extract(&audio).await;
            let fingerprint = self.fingerprint(&audio).await;
            let file_duration = meta.success.then_some(meta.duration_ms);

            for span in cue::track_boundaries(tracks.iter().copied()) {
                let Some(track) = tracks.iter().find(|t| t.track_number == span.track_number)
                else {
                    continue;
                };
                let duration_ms = span.duration_ms(file_duration).unwrap_or_else(|| {
                    self.report(format!(
                        "{}: duration of track {} unknown, {} could not be read",
                        cue_path.display(),
                        span.track_number,
                        audio.display()
                    ));
                    0
                });

                let mut record = self.base_record(&audio, &meta, fingerprint.clone());
                record.id = SongRecord::virtual_track_id(&record.path, span.start_ms);
                record.cue_blob = Some(cue_blob(cue_path, track, span));
                record.duration_ms = duration_ms;
                record.title = Some(
                    track
                        .title
                        .clone()
                        .unwrap_or_else(|| format!("Track {:02}", track.track_number)),
                );
                record.artist = track
                    .performer
                    .clone()
                    .or_else(|| sheet.performer.clone())
                    .or_else(|| meta.artist.clone());
                record.album = sheet.title.clone().or_else(|| meta.album.clone());

                // Each track counts as a song of its own
                if meta.success {
                    self.progress.found_songs += 1;
                    self.group_found += 1;
                }
                self.push(record);
            }

            self.shared
                .dedup
                .index_existing(key, audio.to_string_lossy().into_owned());
        }
    }

    /// Record carrying the physical file's properties
    fn base_record(
        &self,
        path: &Path,
        meta: &MetadataResult,
        fingerprint: Option<String>,
    ) -> SongRecord {
        let path = path.to_string_lossy().into_owned();
        SongRecord {
            id: path.clone(),
            path,
            cue_blob: None,
            title: None,
            artist: None,
            album: None,
            duration_ms: 0,
            size_bytes: meta.size_bytes,
            format: meta.format.clone(),
            bitrate: meta.bitrate,
            sample_rate: meta.sample_rate,
            channels: meta.channels,
            tags_json: meta.tags_json.clone(),
            fingerprint,
            last_scanned_at: now_millis(),
        }
    }

    fn push(&mut self, record: SongRecord) {
        if record.duration_ms < self.options.min_duration_ms {
            debug!(
                "Skipping {} ({} ms < {} ms)",
                record.id, record.duration_ms, self.options.min_duration_ms
            );
            return;
        }
        self.batch.push(record);
    }

    async fn extract(&self, path: &Path) -> MetadataResult {
        let extractor = Arc::clone(&self.shared.extractor);
        let owned = path.to_path_buf();
        let meta = match tokio::task::spawn_blocking(move || extractor.extract(&owned)).await {
            Ok(meta) => meta,
            Err(e) => {
                self.report(format!("{}: metadata extraction aborted: {}", path.display(), e));
                MetadataResult::failed(0)
            }
        };

        if !meta.success {
            self.report(format!("{}: metadata could not be read", path.display()));
        }
        meta
    }

    async fn fingerprint(&self, path: &Path) -> Option<String> {
        if !self.shared.config.compute_fingerprints {
            return None;
        }
        match compute_fingerprint(path).await {
            Ok(digest) => Some(digest),
            Err(e) => {
                self.report(format!("{}: fingerprint failed: {}", path.display(), e));
                None
            }
        }
    }

    async fn quick_key(&self, path: &Path) -> Option<QuickKey> {
        match QuickKey::for_path(path).await {
            Ok(key) => Some(key),
            Err(e) => {
                self.report(format!("{}: {}", path.display(), e));
                None
            }
        }
    }

    fn is_unchanged(&self, key: &QuickKey) -> bool {
        if !self.options.skip_unchanged {
            return false;
        }
        let check = self.shared.dedup.is_duplicate(key);
        if check.is_duplicate {
            debug!("{} unchanged since last scan", key.path.display());
        }
        check.is_duplicate
    }

    fn report(&self, message: String) {
        self.shared.errors.report_error(Some(&self.scan_id), message);
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

fn cue_blob(cue_path: &Path, track: &CueTrackEntry, span: cue::TrackSpan) -> String {
    serde_json::json!({
        "cuePath": cue_path.to_string_lossy(),
        "trackNumber": track.track_number,
        "startMs": span.start_ms,
        "endMs": span.end_ms,
        "indexes": track.indexes,
    })
    .to_string()
}

/// Locate the audio file a CUE `FILE` line points at
///
/// References are relative to the sheet's directory. When the named file is
/// missing, a same-named file with another audio extension is accepted
/// (sheets often outlive a re-encode).
async fn resolve_reference(dir: &Path, reference: &str) -> Option<PathBuf> {
    let reference = if cfg!(windows) {
        reference.to_string()
    } else {
        reference.replace('\\', "/")
    };

    let exact = normalize(&dir.join(&reference));
    if is_regular_file(&exact).await {
        return Some(exact);
    }

    let stem = Path::new(&reference).file_stem()?;
    let parent = exact.parent()?;
    for extension in AUDIO_EXTENSIONS {
        let mut name = OsString::from(stem);
        name.push(".");
        name.push(extension);
        let candidate = parent.join(name);
        if is_regular_file(&candidate).await {
            debug!("Resolved {} to {}", reference, candidate.display());
            return Some(candidate);
        }
    }
    None
}

/// Drop `.` and fold `..` components so a reference compares equal to the
/// walked path of the same file
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

async fn is_regular_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file())
}
