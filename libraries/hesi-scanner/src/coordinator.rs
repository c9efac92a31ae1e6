//! Scan lifecycle management
//!
//! The coordinator owns every scan started through it: it registers the
//! scan, spawns its run on the tokio runtime, tracks status and progress in
//! memory, and mirrors both to the [`StateStore`] so a later process can
//! report on (and resume) scans it never ran itself.

use crate::dedup::Deduplicator;
use crate::error::{Result, ScanError};
use crate::errors::{ErrorAggregator, ErrorCallback, DEFAULT_ERROR_DEBOUNCE};
use crate::run::{RunOutcome, ScanRun};
use crate::state_store::{ScanState, StateStore};
use crate::walker::{WalkControl, Walker, DEFAULT_LISTING_PERMITS};
use dashmap::DashMap;
use hesi_core::types::now_millis;
use hesi_core::{
    MetadataExtractor, ScanCursor, ScanId, ScanOptions, ScanProgress, ScanStatus, SongSink,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// Default number of records per persisted batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Receives every progress update of every scan
pub type ProgressCallback = Arc<dyn Fn(&ScanId, &ScanProgress) + Send + Sync>;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Root of the persisted scan artifacts
    pub state_dir: PathBuf,
    /// Records buffered before a flush and checkpoint
    pub batch_size: usize,
    /// Concurrent directory listings across all scans
    pub listing_permits: usize,
    /// Quiet period before an error summary is emitted
    pub error_debounce: Duration,
    /// Hash full file contents into `SongRecord::fingerprint`
    pub compute_fingerprints: bool,
}

impl CoordinatorConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            listing_permits: DEFAULT_LISTING_PERMITS,
            error_debounce: DEFAULT_ERROR_DEBOUNCE,
            compute_fingerprints: false,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_listing_permits(mut self, permits: usize) -> Self {
        self.listing_permits = permits;
        self
    }

    #[must_use]
    pub fn with_error_debounce(mut self, debounce: Duration) -> Self {
        self.error_debounce = debounce;
        self
    }

    #[must_use]
    pub fn compute_fingerprints(mut self, compute: bool) -> Self {
        self.compute_fingerprints = compute;
        self
    }
}

/// Handle on a live run
struct RunHandle {
    control: WalkControl,
    /// Flips to `true` once the run has stopped and its final state is persisted
    done: watch::Receiver<bool>,
}

/// State shared between the coordinator and its runs
pub(crate) struct Shared {
    pub(crate) config: CoordinatorConfig,
    pub(crate) store: Arc<StateStore>,
    pub(crate) errors: ErrorAggregator,
    pub(crate) dedup: Arc<Deduplicator>,
    pub(crate) walker: Walker,
    pub(crate) extractor: Arc<dyn MetadataExtractor>,
    pub(crate) sink: Arc<dyn SongSink>,
    pub(crate) progress: DashMap<ScanId, ScanProgress>,
    runs: DashMap<ScanId, RunHandle>,
    statuses: DashMap<ScanId, ScanStatus>,
    progress_callback: RwLock<Option<ProgressCallback>>,
}

impl Shared {
    pub(crate) fn progress_callback(&self) -> Option<ProgressCallback> {
        self.progress_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move `scan_id` to `next` if the transition is legal, then persist it
    ///
    /// `extra` runs inside the same state-file update.
    fn transition<F>(&self, scan_id: &ScanId, next: ScanStatus, extra: F) -> bool
    where
        F: FnOnce(&mut ScanState),
    {
        {
            let mut status = self
                .statuses
                .entry(scan_id.clone())
                .or_insert(ScanStatus::Unknown);
            if !status.can_transition_to(next) {
                return false;
            }
            *status = next;
        }

        let persisted = self.store.update_state(scan_id, |state| {
            state.status = next;
            match next {
                ScanStatus::Completed => state.completed_at = Some(now_millis()),
                ScanStatus::Failed => state.failed_at = Some(now_millis()),
                _ => {}
            }
            extra(state);
        });
        if let Err(e) = persisted {
            warn!("Failed to persist status {} for scan {}: {}", next, scan_id, e);
            self.errors
                .report_error(Some(scan_id), format!("failed to persist status {next}: {e}"));
        }
        true
    }

    /// Record how a run ended
    fn finish(&self, scan_id: &ScanId, outcome: std::result::Result<Result<RunOutcome>, JoinError>) {
        match outcome {
            Ok(Ok(RunOutcome::Completed { checkpoint_error })) => {
                info!("Scan {} completed", scan_id);
                self.transition(scan_id, ScanStatus::Completed, |state| {
                    state.checkpoint_error = checkpoint_error;
                });
            }
            Ok(Ok(RunOutcome::Cancelled)) => {
                info!("Scan {} cancelled", scan_id);
                self.transition(scan_id, ScanStatus::Cancelled, |_| {});
            }
            Ok(Err(e)) => {
                error!("Scan {} failed: {}", scan_id, e);
                self.fail(scan_id, e.to_string());
            }
            Err(e) => {
                error!("Scan {} run aborted: {}", scan_id, e);
                self.fail(scan_id, format!("scan run aborted: {e}"));
            }
        }

        let progress = self.progress.get_mut(scan_id).map(|mut progress| {
            progress.finished = true;
            progress.last_updated = now_millis();
            progress.clone()
        });
        if let Some(progress) = progress {
            if let Err(e) = self.store.write_progress(scan_id, &progress) {
                warn!("Failed to persist final progress for scan {}: {}", scan_id, e);
            }
        }

        self.runs.remove(scan_id);
    }

    fn fail(&self, scan_id: &ScanId, message: String) {
        self.transition(scan_id, ScanStatus::Failed, |state| {
            state.error_message = Some(message);
        });
    }
}

/// Starts, tracks and stops scans
///
/// Construct once per process and share it (it is cheap to clone). Every
/// method is non-blocking with respect to running scans; status and progress
/// queries read cached snapshots, falling back to the persisted artifacts for
/// scans run by an earlier process.
#[derive(Clone)]
pub struct ScanCoordinator {
    shared: Arc<Shared>,
}

impl ScanCoordinator {
    /// Create a coordinator persisting under `config.state_dir`
    pub fn new(
        config: CoordinatorConfig,
        extractor: Arc<dyn MetadataExtractor>,
        sink: Arc<dyn SongSink>,
    ) -> Self {
        let store = Arc::new(StateStore::new(config.state_dir.clone()));
        let errors = ErrorAggregator::with_store(config.error_debounce, Arc::clone(&store));
        let walker = Walker::new(config.listing_permits).with_error_reporting(errors.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                errors,
                dedup: Arc::new(Deduplicator::new()),
                walker,
                extractor,
                sink,
                progress: DashMap::new(),
                runs: DashMap::new(),
                statuses: DashMap::new(),
                progress_callback: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Error aggregator fed by every scan of this coordinator
    pub fn errors(&self) -> &ErrorAggregator {
        &self.shared.errors
    }

    /// Quick-key index shared by every scan of this coordinator
    pub fn deduplicator(&self) -> &Arc<Deduplicator> {
        &self.shared.dedup
    }

    pub fn state_store(&self) -> &StateStore {
        &self.shared.store
    }

    /// Receive debounced error summaries as `(scan id or "_global", json)`
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.shared.errors.set_error_callback(callback);
    }

    /// Receive every progress update
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self
            .shared
            .progress_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Register a scan and start it in the background
    ///
    /// Returns as soon as the run is spawned.
    ///
    /// # Errors
    /// [`ScanError::NotInitialized`] when called outside a tokio runtime.
    pub fn start_scan(&self, options: ScanOptions) -> Result<ScanId> {
        let runtime = Handle::try_current().map_err(|_| ScanError::NotInitialized)?;

        let scan_id = ScanId::generate();
        info!(
            "Starting scan {} over {} root(s), {} exclusion(s)",
            scan_id,
            options.roots.len(),
            options.excluded_paths.len()
        );

        self.shared.statuses.insert(scan_id.clone(), ScanStatus::Pending);
        let state = ScanState::new(scan_id.clone(), options.clone());
        if let Err(e) = self.shared.store.create_state(&state) {
            warn!("Failed to persist initial state of scan {}: {}", scan_id, e);
            self.shared
                .errors
                .report_error(None, format!("failed to persist scan {scan_id}: {e}"));
        }

        self.launch(&runtime, scan_id.clone(), options, None, ScanProgress::starting_at(0));
        Ok(scan_id)
    }

    /// Restart a stopped or interrupted scan from its persisted cursor
    ///
    /// Works for scans that were cancelled, failed, or left non-terminal by
    /// a process that died. The scan keeps its id. Without a cursor on disk
    /// the walk starts over from the roots.
    pub fn resume_scan(&self, scan_id: &ScanId) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| ScanError::NotInitialized)?;

        if self.shared.runs.contains_key(scan_id) {
            return Err(ScanError::InvalidState {
                scan_id: scan_id.clone(),
                status: self.get_status(scan_id),
            });
        }

        let state = self
            .shared
            .store
            .load_state(scan_id)?
            .ok_or_else(|| ScanError::UnknownScan(scan_id.clone()))?;
        if state.status == ScanStatus::Completed {
            return Err(ScanError::InvalidState {
                scan_id: scan_id.clone(),
                status: state.status,
            });
        }

        let cursor = self.shared.store.load_cursor(scan_id)?;
        let found_songs = self
            .shared
            .store
            .load_checkpoint(scan_id)?
            .map_or(0, |checkpoint| checkpoint.found_songs);
        let mut progress =
            ScanProgress::starting_at(cursor.as_ref().map_or(0, |c| c.processed_count));
        progress.found_songs = found_songs;

        info!(
            "Resuming scan {} ({}) with {} pending path(s)",
            scan_id,
            state.status,
            cursor.as_ref().map_or(0, |c| c.pending_paths.len())
        );

        self.shared.statuses.insert(scan_id.clone(), ScanStatus::Pending);
        self.launch(&runtime, scan_id.clone(), state.options, cursor, progress);
        Ok(())
    }

    fn launch(
        &self,
        runtime: &Handle,
        scan_id: ScanId,
        options: ScanOptions,
        cursor: Option<ScanCursor>,
        progress: ScanProgress,
    ) {
        let control = WalkControl::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.shared.runs.insert(
            scan_id.clone(),
            RunHandle {
                control: control.clone(),
                done: done_rx,
            },
        );
        self.shared.progress.insert(scan_id.clone(), progress.clone());

        self.shared.transition(&scan_id, ScanStatus::Running, |state| {
            state.completed_at = None;
            state.failed_at = None;
            state.error_message = None;
            state.checkpoint_error = None;
        });

        let run = ScanRun::new(
            Arc::clone(&self.shared),
            scan_id.clone(),
            options,
            cursor,
            progress,
            &control,
        );
        let task = runtime.spawn(run.execute());

        // Supervisor: a panicking run still ends up FAILED
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            let outcome = task.await;
            shared.finish(&scan_id, outcome);
            done_tx.send_replace(true);
        });
    }

    /// Cancel a scan
    ///
    /// A live run is told to stop and the scan becomes `CANCELLED`; batches
    /// already persisted stay. Stopping a scan that already finished is a
    /// no-op. Returns `false` only for ids this coordinator knows nothing
    /// about.
    pub fn stop_scan(&self, scan_id: &ScanId) -> bool {
        let control = self.shared.runs.get(scan_id).map(|run| run.control.clone());
        if let Some(control) = control {
            control.cancel();
            if self.shared.transition(scan_id, ScanStatus::Cancelled, |_| {}) {
                info!("Scan {} cancellation requested", scan_id);
            }
            return true;
        }

        self.shared.statuses.contains_key(scan_id)
            || matches!(self.shared.store.load_state(scan_id), Ok(Some(_)))
    }

    /// Hold a running scan before its next dequeue
    pub fn pause_scan(&self, scan_id: &ScanId) -> bool {
        let Some(control) = self.shared.runs.get(scan_id).map(|run| run.control.clone()) else {
            return false;
        };
        if !self.shared.transition(scan_id, ScanStatus::Paused, |_| {}) {
            return false;
        }
        control.pause();
        info!("Scan {} paused", scan_id);
        true
    }

    /// Continue a paused scan
    pub fn resume_paused_scan(&self, scan_id: &ScanId) -> bool {
        let Some(control) = self.shared.runs.get(scan_id).map(|run| run.control.clone()) else {
            return false;
        };
        if self.get_status(scan_id) != ScanStatus::Paused
            || !self.shared.transition(scan_id, ScanStatus::Running, |_| {})
        {
            return false;
        }
        control.resume();
        info!("Scan {} resumed", scan_id);
        true
    }

    /// Current status; `Unknown` for ids never seen here or on disk
    pub fn get_status(&self, scan_id: &ScanId) -> ScanStatus {
        if let Some(status) = self.shared.statuses.get(scan_id) {
            return *status;
        }
        match self.shared.store.load_state(scan_id) {
            Ok(Some(state)) => state.status,
            _ => ScanStatus::Unknown,
        }
    }

    /// Latest progress snapshot
    pub fn get_progress(&self, scan_id: &ScanId) -> Option<ScanProgress> {
        if let Some(progress) = self.shared.progress.get(scan_id) {
            return Some(progress.clone());
        }
        self.shared.store.load_progress(scan_id).ok().flatten()
    }

    /// Ids of every scan known in memory or on disk
    pub fn scan_ids(&self) -> Vec<ScanId> {
        let mut ids: BTreeSet<String> = self
            .shared
            .statuses
            .iter()
            .map(|entry| entry.key().as_str().to_string())
            .collect();
        match self.shared.store.list_scan_ids() {
            Ok(stored) => ids.extend(stored.into_iter().map(|id| id.as_str().to_string())),
            Err(e) => warn!("Failed to list persisted scans: {}", e),
        }
        ids.into_iter().map(ScanId::new).collect()
    }

    /// Wait until the current run of `scan_id` (if any) has stopped
    ///
    /// Returns the status after the run's final state was persisted.
    pub async fn wait_for(&self, scan_id: &ScanId) -> ScanStatus {
        let done = self.shared.runs.get(scan_id).map(|run| run.done.clone());
        if let Some(mut done) = done {
            // An error means the supervisor is gone, which also means done
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_status(scan_id)
    }
}

impl std::fmt::Debug for ScanCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCoordinator")
            .field("config", &self.shared.config)
            .field("active_runs", &self.shared.runs.len())
            .finish()
    }
}
