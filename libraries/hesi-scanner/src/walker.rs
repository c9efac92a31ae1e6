//! Breadth-first directory walker
//!
//! The walk is driven by an explicit FIFO queue of paths. Because that queue
//! is plain data, the exact frontier can be captured at any point as a
//! [`ScanCursor`] and a later walk can resume from it.
//!
//! Children of a directory are enqueued sorted by name, so two walks over an
//! unchanged tree visit files in the same order. Directory listing is bounded
//! by a semaphore shared by every walk created from the same [`Walker`].

use crate::errors::ErrorAggregator;
use hesi_core::{ScanCursor, ScanId, ScanOptions};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of concurrent directory listings
pub const DEFAULT_LISTING_PERMITS: usize = 4;

/// Whether `path` is skipped during the walk
///
/// Hidden entries (name starting with `.`) are always skipped. Excluded
/// prefixes match on whole path components, so `/a/b` excludes `/a/b/c` but
/// not `/a/bc`.
pub fn is_excluded(path: &Path, excluded: &[PathBuf]) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'));

    hidden || excluded.iter().any(|prefix| path.starts_with(prefix))
}

/// Pause and cancel switches for one walk
///
/// Cloning shares the same switches.
#[derive(Debug, Clone)]
pub struct WalkControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for WalkControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WalkControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    /// Stop the walk before its next dequeue
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hold the walk before its next dequeue
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

/// Factory for walks sharing one listing bound and error sink
#[derive(Debug, Clone)]
pub struct Walker {
    listing_permits: Arc<Semaphore>,
    errors: Option<ErrorAggregator>,
}

impl Default for Walker {
    fn default() -> Self {
        Self::new(DEFAULT_LISTING_PERMITS)
    }
}

impl Walker {
    /// Walker allowing `listing_permits` concurrent directory listings
    pub fn new(listing_permits: usize) -> Self {
        Self {
            listing_permits: Arc::new(Semaphore::new(listing_permits.max(1))),
            errors: None,
        }
    }

    /// Report unreadable entries to `errors`
    #[must_use]
    pub fn with_error_reporting(mut self, errors: ErrorAggregator) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Start a walk over `roots`, or over `cursor` when resuming
    pub fn walk(
        &self,
        roots: &[PathBuf],
        options: &ScanOptions,
        cursor: Option<ScanCursor>,
        control: &WalkControl,
        scan_id: Option<ScanId>,
    ) -> Walk {
        let (queue, processed) = match cursor {
            Some(cursor) => (cursor.pending_paths.into(), cursor.processed_count),
            None => (roots.iter().cloned().collect(), 0),
        };

        Walk {
            queue,
            processed,
            excluded: options.excluded_paths.clone(),
            follow_symlinks: options.follow_symlinks,
            visited_dirs: HashSet::new(),
            listing_permits: Arc::clone(&self.listing_permits),
            cancel: control.cancel.clone(),
            paused: control.paused.subscribe(),
            errors: self.errors.clone(),
            scan_id,
        }
    }

    /// Walk to the end, calling `on_file` for every regular file
    ///
    /// `on_progress` receives the running processed count after each file.
    /// Returns the remaining frontier: empty after a full walk, the pending
    /// queue after a cancellation.
    pub async fn scan_roots<F, P>(
        &self,
        roots: &[PathBuf],
        options: &ScanOptions,
        mut on_file: F,
        cursor: Option<ScanCursor>,
        mut on_progress: Option<P>,
        control: &WalkControl,
    ) -> ScanCursor
    where
        F: FnMut(&Path),
        P: FnMut(u64, &Path),
    {
        let mut walk = self.walk(roots, options, cursor, control, None);
        while let Some(file) = walk.next_file().await {
            on_file(&file);
            if let Some(on_progress) = on_progress.as_mut() {
                on_progress(walk.processed_count(), &file);
            }
        }
        walk.cursor()
    }
}

/// One in-progress walk
///
/// Pull files with [`Walk::next_file`]; capture the frontier with
/// [`Walk::cursor`].
#[derive(Debug)]
pub struct Walk {
    queue: VecDeque<PathBuf>,
    processed: u64,
    excluded: Vec<PathBuf>,
    follow_symlinks: bool,
    visited_dirs: HashSet<PathBuf>,
    listing_permits: Arc<Semaphore>,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    errors: Option<ErrorAggregator>,
    scan_id: Option<ScanId>,
}

enum Entry {
    File,
    Dir,
    Skip,
}

impl Walk {
    /// Files handed out so far, including those counted by a resumed cursor
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Paths still queued, front first
    pub fn pending(&self) -> impl Iterator<Item = &PathBuf> {
        self.queue.iter()
    }

    /// Snapshot of the frontier
    pub fn cursor(&self) -> ScanCursor {
        ScanCursor::new(self.queue.iter().cloned().collect(), self.processed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next regular file, or `None` once the queue is empty or the walk is
    /// cancelled
    pub async fn next_file(&mut self) -> Option<PathBuf> {
        loop {
            if !self.wait_while_paused().await {
                return None;
            }

            let path = self.queue.pop_front()?;

            match self.classify(&path).await {
                Entry::File => {
                    self.processed += 1;
                    return Some(path);
                }
                Entry::Dir => self.list(&path).await,
                Entry::Skip => {}
            }
        }
    }

    /// Block while paused; `false` when the walk is cancelled
    async fn wait_while_paused(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if *self.paused.borrow() {
            debug!("Walk paused with {} queued paths", self.queue.len());
            let paused = &mut self.paused;
            let resumed = async move {
                let _ = paused.wait_for(|paused| !*paused).await;
            };
            tokio::select! {
                () = resumed => {}
                () = self.cancel.cancelled() => {}
            }
        }
        !self.cancel.is_cancelled()
    }

    async fn classify(&self, path: &Path) -> Entry {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            // Deleted since it was queued
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Entry::Skip,
            Err(e) => {
                self.report(path, &e);
                return Entry::Skip;
            }
        };

        if !metadata.file_type().is_symlink() {
            return if metadata.is_dir() {
                Entry::Dir
            } else if metadata.is_file() {
                Entry::File
            } else {
                Entry::Skip
            };
        }

        match tokio::fs::metadata(path).await {
            Ok(target) if target.is_file() => Entry::File,
            Ok(target) if target.is_dir() => {
                if !self.follow_symlinks {
                    debug!("Not following symlinked directory {}", path.display());
                    return Entry::Skip;
                }
                Entry::Dir
            }
            Ok(_) => Entry::Skip,
            // Dangling link
            Err(e) if e.kind() == io::ErrorKind::NotFound => Entry::Skip,
            Err(e) => {
                self.report(path, &e);
                Entry::Skip
            }
        }
    }

    async fn list(&mut self, dir: &Path) {
        if self.follow_symlinks {
            // Symlink cycles would otherwise loop forever
            let canonical = tokio::fs::canonicalize(dir)
                .await
                .unwrap_or_else(|_| dir.to_path_buf());
            if !self.visited_dirs.insert(canonical) {
                return;
            }
        }

        let Ok(_permit) = self.listing_permits.acquire().await else {
            return;
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                self.report(dir, &e);
                return;
            }
        };

        let mut children = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => children.push(entry.path()),
                Ok(None) => break,
                Err(e) => {
                    self.report(dir, &e);
                    break;
                }
            }
        }
        children.sort();

        self.queue.extend(
            children
                .into_iter()
                .filter(|child| !is_excluded(child, &self.excluded)),
        );
    }

    fn report(&self, path: &Path, error: &io::Error) {
        let message = format!("{}: {}", path.display(), error);
        match &self.errors {
            Some(errors) => errors.report_error(self.scan_id.as_ref(), message),
            None => debug!("Walk error: {}", message),
        }
    }
}
