//! Durable scan artifacts
//!
//! Layout under the state root:
//!
//! ```text
//! scan_states/<scanId>.json        lifecycle record
//! scan_states/global_errors.json   errors reported outside any scan
//! scan_progress/<scanId>.json      latest progress
//! scan_checkpoints/<scanId>.chk    last checkpoint
//! scan_checkpoints/<scanId>.cursor resume cursor (line format)
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so
//! a crash leaves either the old file or the new one.
//!
//! The files are small and the API is synchronous. Async callers on the hot
//! path move writes onto the blocking pool.

use crate::error::{Result, ScanError};
use hesi_core::types::now_millis;
use hesi_core::{ErrorSummary, ScanCursor, ScanId, ScanOptions, ScanProgress, ScanStatus, GLOBAL_ERROR_KEY};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const STATES_DIR: &str = "scan_states";
const PROGRESS_DIR: &str = "scan_progress";
const CHECKPOINTS_DIR: &str = "scan_checkpoints";
const GLOBAL_ERRORS_FILE: &str = "global_errors.json";

/// Lifecycle record of one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanState {
    pub scan_id: ScanId,
    pub status: ScanStatus,
    pub options: ScanOptions,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_summary: Option<ErrorSummary>,
    /// Set when the final checkpoint of a completed scan could not be written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
}

impl ScanState {
    /// New `PENDING` record
    pub fn new(scan_id: ScanId, options: ScanOptions) -> Self {
        Self {
            scan_id,
            status: ScanStatus::Pending,
            options,
            created_at: now_millis(),
            updated_at: None,
            completed_at: None,
            failed_at: None,
            error_message: None,
            last_error_summary: None,
            checkpoint_error: None,
        }
    }
}

/// Safe resumption point written at batch boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// File processed most recently before the checkpoint
    pub last_path: Option<PathBuf>,
    /// Files fully processed and persisted
    pub processed_count: u64,
    /// Songs found up to the checkpoint
    #[serde(default)]
    pub found_songs: u64,
    pub updated_at: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalErrors {
    last_error_summary: ErrorSummary,
}

/// File-backed store for scan artifacts
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on state files
    state_lock: Mutex<()>,
}

impl StateStore {
    /// Store rooted at `root`; directories are created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, scan_id: &ScanId) -> PathBuf {
        self.root.join(STATES_DIR).join(format!("{scan_id}.json"))
    }

    fn progress_path(&self, scan_id: &ScanId) -> PathBuf {
        self.root.join(PROGRESS_DIR).join(format!("{scan_id}.json"))
    }

    fn checkpoint_path(&self, scan_id: &ScanId) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR).join(format!("{scan_id}.chk"))
    }

    fn cursor_path(&self, scan_id: &ScanId) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR).join(format!("{scan_id}.cursor"))
    }

    fn global_errors_path(&self) -> PathBuf {
        self.root.join(STATES_DIR).join(GLOBAL_ERRORS_FILE)
    }

    /// Write the initial record of a scan
    pub fn create_state(&self, state: &ScanState) -> Result<()> {
        let _guard = self.state_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.state_path(&state.scan_id), state)
    }

    pub fn load_state(&self, scan_id: &ScanId) -> Result<Option<ScanState>> {
        read_json(&self.state_path(scan_id))
    }

    /// Read-modify-write a state record, stamping `updatedAt`
    pub fn update_state<F>(&self, scan_id: &ScanId, update: F) -> Result<ScanState>
    where
        F: FnOnce(&mut ScanState),
    {
        let _guard = self.state_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.state_path(scan_id);
        let mut state: ScanState =
            read_json(&path)?.ok_or_else(|| ScanError::UnknownScan(scan_id.clone()))?;
        update(&mut state);
        state.updated_at = Some(now_millis());
        write_json(&path, &state)?;
        Ok(state)
    }

    /// Every scan id with a state record, sorted
    pub fn list_scan_ids(&self) -> Result<Vec<ScanId>> {
        let dir = self.root.join(STATES_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(GLOBAL_ERRORS_FILE) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(ScanId::new(stem));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    pub fn write_progress(&self, scan_id: &ScanId, progress: &ScanProgress) -> Result<()> {
        write_json(&self.progress_path(scan_id), progress)
    }

    pub fn load_progress(&self, scan_id: &ScanId) -> Result<Option<ScanProgress>> {
        read_json(&self.progress_path(scan_id))
    }

    /// Write the checkpoint and its cursor
    ///
    /// The cursor goes first: a checkpoint on disk always has a cursor at
    /// least as new as itself.
    pub fn write_checkpoint(
        &self,
        scan_id: &ScanId,
        checkpoint: &Checkpoint,
        cursor: &ScanCursor,
    ) -> Result<()> {
        write_atomic(&self.cursor_path(scan_id), &cursor.serialize())?;
        write_json(&self.checkpoint_path(scan_id), checkpoint)
    }

    pub fn load_checkpoint(&self, scan_id: &ScanId) -> Result<Option<Checkpoint>> {
        read_json(&self.checkpoint_path(scan_id))
    }

    pub fn load_cursor(&self, scan_id: &ScanId) -> Result<Option<ScanCursor>> {
        match std::fs::read(self.cursor_path(scan_id)) {
            Ok(bytes) => Ok(Some(ScanCursor::deserialize(&bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a rolling error summary
    ///
    /// Scan keys land in the scan's state record, the global key in its own
    /// file. Fails for scan ids without a state record.
    pub fn write_error_summary(&self, key: &str, summary: &ErrorSummary) -> Result<()> {
        if key == GLOBAL_ERROR_KEY {
            let global = GlobalErrors {
                last_error_summary: summary.clone(),
            };
            let _guard = self.state_lock.lock().unwrap_or_else(PoisonError::into_inner);
            return write_json(&self.global_errors_path(), &global);
        }

        self.update_state(&ScanId::new(key), |state| {
            state.last_error_summary = Some(summary.clone());
        })
        .map(|_| ())
    }

    pub fn load_global_errors(&self) -> Result<Option<ErrorSummary>> {
        Ok(read_json::<GlobalErrors>(&self.global_errors_path())?.map(|g| g.last_error_summary))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        (dir, store)
    }

    fn options() -> ScanOptions {
        ScanOptions::new(vec![PathBuf::from("/music")])
    }

    #[test]
    fn state_round_trip_and_update() {
        let (_dir, store) = store();
        let id = ScanId::new("scan-1");
        store.create_state(&ScanState::new(id.clone(), options())).unwrap();

        let updated = store
            .update_state(&id, |s| s.status = ScanStatus::Running)
            .unwrap();
        assert_eq!(updated.status, ScanStatus::Running);
        assert!(updated.updated_at.is_some());

        let loaded = store.load_state(&id).unwrap().unwrap();
        assert_eq!(loaded, updated);
        assert_eq!(store.list_scan_ids().unwrap(), vec![id]);
    }

    #[test]
    fn state_file_uses_documented_keys() {
        let (dir, store) = store();
        let id = ScanId::new("scan-keys");
        store.create_state(&ScanState::new(id.clone(), options())).unwrap();
        store
            .update_state(&id, |s| {
                s.status = ScanStatus::Failed;
                s.failed_at = Some(1);
                s.error_message = Some("disk full".into());
            })
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("scan_states/scan-keys.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["scanId"], "scan-keys");
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["options"]["roots"][0], "/music");
        assert_eq!(value["errorMessage"], "disk full");
        assert!(value.get("completedAt").is_none());
    }

    #[test]
    fn missing_artifacts_read_as_none() {
        let (_dir, store) = store();
        let id = ScanId::new("nope");
        assert!(store.load_state(&id).unwrap().is_none());
        assert!(store.load_progress(&id).unwrap().is_none());
        assert!(store.load_cursor(&id).unwrap().is_none());
        assert!(store.list_scan_ids().unwrap().is_empty());
        assert!(matches!(
            store.update_state(&id, |_| {}),
            Err(ScanError::UnknownScan(_))
        ));
    }

    #[test]
    fn checkpoint_writes_cursor_alongside() {
        let (dir, store) = store();
        let id = ScanId::new("scan-chk");
        let cursor = ScanCursor::new(vec![PathBuf::from("/music/b"), PathBuf::from("/music/a")], 7);
        let checkpoint = Checkpoint {
            last_path: Some(PathBuf::from("/music/x.flac")),
            processed_count: 7,
            found_songs: 5,
            updated_at: 1,
        };
        store.write_checkpoint(&id, &checkpoint, &cursor).unwrap();

        assert_eq!(store.load_cursor(&id).unwrap(), Some(cursor));
        assert_eq!(store.load_checkpoint(&id).unwrap(), Some(checkpoint));
        assert!(!dir.path().join("scan_checkpoints/scan-chk.cursor.tmp").exists());
    }

    #[test]
    fn error_summaries_go_to_state_or_global_file() {
        let (_dir, store) = store();
        let id = ScanId::new("scan-err");
        store.create_state(&ScanState::new(id.clone(), options())).unwrap();

        let mut summary = ErrorSummary::new();
        summary.record("unreadable directory");
        store.write_error_summary(id.as_str(), &summary).unwrap();
        store.write_error_summary(GLOBAL_ERROR_KEY, &summary).unwrap();

        let state = store.load_state(&id).unwrap().unwrap();
        assert_eq!(state.last_error_summary, Some(summary.clone()));
        assert_eq!(store.load_global_errors().unwrap(), Some(summary.clone()));
        // The global file is not a scan
        assert_eq!(store.list_scan_ids().unwrap(), vec![id]);

        assert!(store.write_error_summary("never-started", &summary).is_err());
    }
}
