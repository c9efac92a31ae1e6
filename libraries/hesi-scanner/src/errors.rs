//! Error aggregation with debounced emission
//!
//! Per-item failures are counted per scan (or under the global key), the
//! rolling summary is persisted on every report, and the host callback sees
//! at most one emission per quiet period per key.

use crate::state_store::StateStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hesi_core::{ErrorSummary, ScanId, GLOBAL_ERROR_KEY};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default quiet period before a summary is emitted
pub const DEFAULT_ERROR_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Receives `(key, summary_json)` emissions
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct PendingEmit {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    summaries: DashMap<String, ErrorSummary>,
    pending: DashMap<String, PendingEmit>,
    callback: RwLock<Option<ErrorCallback>>,
    store: Option<Arc<StateStore>>,
    debounce: Duration,
    generations: AtomicU64,
}

impl Inner {
    fn emit(&self, key: &str) {
        let Some(json) = self.summaries.get(key).map(|s| s.to_json()) else {
            return;
        };
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(key, &json),
            None => debug!("No error callback set, dropping summary for {}", key),
        }
    }
}

/// Collects per-item errors and forwards debounced summaries
///
/// Cheap to clone; clones share the same summaries and timers.
#[derive(Clone)]
pub struct ErrorAggregator {
    inner: Arc<Inner>,
}

impl ErrorAggregator {
    /// In-memory aggregator with the given debounce window
    pub fn new(debounce: Duration) -> Self {
        Self::build(debounce, None)
    }

    /// Aggregator that persists summaries through `store`
    pub fn with_store(debounce: Duration, store: Arc<StateStore>) -> Self {
        Self::build(debounce, Some(store))
    }

    fn build(debounce: Duration, store: Option<Arc<StateStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                summaries: DashMap::new(),
                pending: DashMap::new(),
                callback: RwLock::new(None),
                store,
                debounce,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the emission callback
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Snapshot of the summary for a scan id or [`GLOBAL_ERROR_KEY`]
    pub fn summary(&self, key: &str) -> Option<ErrorSummary> {
        self.inner.summaries.get(key).map(|s| s.clone())
    }

    /// Record an error for `scan_id`, or globally when `None`
    pub fn report_error(&self, scan_id: Option<&ScanId>, message: impl Into<String>) {
        let key = scan_id.map_or(GLOBAL_ERROR_KEY, ScanId::as_str).to_string();
        let message = message.into();
        warn!("[{}] {}", key, message);

        // The entry stays locked while persisting so writes for one key land
        // in the order they were recorded
        let mut summary = self
            .inner
            .summaries
            .entry(key.clone())
            .or_insert_with(ErrorSummary::new);
        summary.record(message);
        let persisted = self
            .inner
            .store
            .as_ref()
            .map(|store| persist(store, &key, &summary));
        drop(summary);

        if let Some(Err(e)) = persisted {
            warn!("Failed to persist error summary for {}: {}", key, e);
            self.cancel_pending(&key);
            self.inner.emit(&key);
            return;
        }

        self.schedule(key);
    }

    fn cancel_pending(&self, key: &str) {
        if let Some((_, pending)) = self.inner.pending.remove(key) {
            pending.handle.abort();
        }
    }

    fn schedule(&self, key: String) {
        if self.inner.debounce.is_zero() {
            self.inner.emit(&key);
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            // No timer without a runtime
            self.inner.emit(&key);
            return;
        };

        // The entry stays locked until the timer is registered, so the timer
        // can never look for it before it exists
        let entry = self.inner.pending.entry(key.clone());
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let current = inner
                .pending
                .remove_if(&key, |_, pending| pending.generation == generation);
            if current.is_some() {
                inner.emit(&key);
            }
        });

        let pending = PendingEmit { generation, handle };
        match entry {
            Entry::Occupied(mut occupied) => occupied.insert(pending).handle.abort(),
            Entry::Vacant(vacant) => {
                vacant.insert(pending);
            }
        }
    }
}

/// Write a summary through the store off the async worker when possible
fn persist(store: &StateStore, key: &str, summary: &ErrorSummary) -> crate::Result<()> {
    let write = || store.write_error_summary(key, summary);
    match Handle::try_current() {
        Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(write)
        }
        _ => write(),
    }
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_DEBOUNCE)
    }
}

impl std::fmt::Debug for ErrorAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorAggregator")
            .field("keys", &self.inner.summaries.len())
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::ScanState;
    use hesi_core::{ScanOptions, MAX_ERROR_SAMPLES};
    use std::sync::Mutex;

    type Emissions = Arc<Mutex<Vec<(String, String)>>>;

    fn recording(aggregator: &ErrorAggregator) -> Emissions {
        let emissions: Emissions = Arc::default();
        let sink = Arc::clone(&emissions);
        aggregator.set_error_callback(Arc::new(move |key, json| {
            sink.lock().unwrap().push((key.to_string(), json.to_string()));
        }));
        emissions
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_into_one_emission() {
        let aggregator = ErrorAggregator::new(DEFAULT_ERROR_DEBOUNCE);
        let emissions = recording(&aggregator);
        let scan = ScanId::new("scan-a");

        for i in 0..10 {
            aggregator.report_error(Some(&scan), format!("permission denied {i}"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(emissions.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(2100)).await;

        let emissions = emissions.lock().unwrap();
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].0, "scan-a");

        let summary: serde_json::Value = serde_json::from_str(&emissions[0].1).unwrap();
        assert_eq!(summary["count"], 10);
        assert_eq!(summary["samples"].as_array().unwrap().len(), MAX_ERROR_SAMPLES);
        assert_eq!(summary["samples"][0], "permission denied 0");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_debounced_independently() {
        let aggregator = ErrorAggregator::new(Duration::from_millis(500));
        let emissions = recording(&aggregator);

        aggregator.report_error(Some(&ScanId::new("a")), "one");
        aggregator.report_error(None, "global");
        tokio::time::sleep(Duration::from_millis(600)).await;

        let mut keys: Vec<String> = emissions.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![GLOBAL_ERROR_KEY.to_string(), "a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_emits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let aggregator = ErrorAggregator::with_store(DEFAULT_ERROR_DEBOUNCE, Arc::clone(&store));
        let emissions = recording(&aggregator);

        // No state record exists for this id, so persisting fails
        aggregator.report_error(Some(&ScanId::new("ghost")), "lost");
        assert_eq!(emissions.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn summaries_are_persisted_on_every_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let id = ScanId::new("scan-p");
        store
            .create_state(&ScanState::new(id.clone(), ScanOptions::new(vec![])))
            .unwrap();

        let aggregator = ErrorAggregator::with_store(DEFAULT_ERROR_DEBOUNCE, Arc::clone(&store));
        aggregator.report_error(Some(&id), "first");
        aggregator.report_error(Some(&id), "second");

        let state = store.load_state(&id).unwrap().unwrap();
        let summary = state.last_error_summary.unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.samples, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(aggregator.summary("scan-p"), Some(summary));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn short_debounce_never_loses_an_emission() {
        let aggregator = ErrorAggregator::new(Duration::from_millis(1));
        let emissions = recording(&aggregator);

        for i in 0..50 {
            aggregator.report_error(Some(&ScanId::new(format!("scan-{i}"))), "boom");
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(emissions.lock().unwrap().len(), 50);
        assert!(aggregator.inner.pending.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_global_reports_persist_the_latest_summary() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let aggregator = ErrorAggregator::with_store(Duration::from_millis(1), Arc::clone(&store));
        let emissions = recording(&aggregator);

        let reporters: Vec<_> = (0..8)
            .map(|t| {
                let aggregator = aggregator.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        aggregator.report_error(None, format!("reporter {t} error {i}"));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for reporter in reporters {
            reporter.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let persisted = store.load_global_errors().unwrap().unwrap();
        assert_eq!(persisted.count, 200);
        assert!(!dir.path().join("scan_states/global_errors.json.tmp").exists());

        // Nothing failed to persist, so every emission was debounced and the
        // last timer saw the full count
        let emissions = emissions.lock().unwrap();
        assert!(emissions.iter().any(|(key, json)| {
            let summary: serde_json::Value = serde_json::from_str(json).unwrap();
            key == GLOBAL_ERROR_KEY && summary["count"] == 200
        }));
    }

    #[test]
    fn without_runtime_emission_is_immediate() {
        let aggregator = ErrorAggregator::default();
        let emissions = recording(&aggregator);
        aggregator.report_error(None, "outside runtime");
        assert_eq!(emissions.lock().unwrap().len(), 1);
    }
}
