/// Reconciliation services: scan a local archive, fetch what is missing
mod fetch;
mod scan;

#[cfg(test)]
mod test_support;

use crate::clients::{Renderer, Store};
use crate::config::ReconcileSettings;
use crate::domain::{
    FetchReport, ReconcileOutcome, ReconcileState, ReconcileSummary, SatellitePattern, ScanOutcome,
    ScanParams,
};
use crate::errors::{ApiResult, FetchError};
use crate::repo::CacheRepo;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

type ProgressFn = dyn Fn(usize, usize, &str) + Send + Sync;
type ItemFn = dyn Fn(&Path, bool) + Send + Sync;
type ErrorFn = dyn Fn(DateTime<Utc>, &FetchError) + Send + Sync;
type CancelFn = dyn Fn() -> bool + Send + Sync;

/// Listener hooks invoked synchronously by the reconciler.
///
/// Progress receives `(current, total, message)`; step messages read
/// `Step k/6: ...` and phase messages `Phase k/2: ...`. The item hook fires
/// exactly once per fetched timestamp. The cancel hook is polled between scan
/// steps and before each fetch dispatch; returning true stops further work.
#[derive(Clone, Default)]
pub struct Callbacks {
    progress: Option<Arc<ProgressFn>>,
    item: Option<Arc<ItemFn>>,
    error: Option<Arc<ErrorFn>>,
    cancel: Option<Arc<CancelFn>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(usize, usize, &str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_item(mut self, f: impl Fn(&Path, bool) + Send + Sync + 'static) -> Self {
        self.item = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(DateTime<Utc>, &FetchError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn cancel_when(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.cancel = Some(Arc::new(f));
        self
    }

    fn progress(&self, current: usize, total: usize, message: &str) {
        debug!(current, total, message, "progress");
        if let Some(f) = &self.progress {
            f(current, total, message);
        }
    }

    fn item(&self, path: &Path, success: bool) {
        if let Some(f) = &self.item {
            f(path, success);
        }
    }

    fn error(&self, timestamp: DateTime<Utc>, err: &FetchError) {
        if let Some(f) = &self.error {
            f(timestamp, err);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|f| f()).unwrap_or(false)
    }
}

/// Brings a local image directory to parity with the expected timestamp set.
///
/// Recent timestamps are fetched from the CDN store, older ones from the
/// archive store (followed by the render step). The cache handle is shared
/// by the scan and every fetch worker.
pub struct Reconciler {
    cache: CacheRepo,
    cdn: Arc<dyn Store>,
    archive: Arc<dyn Store>,
    renderer: Arc<dyn Renderer>,
    settings: ReconcileSettings,
    state: Mutex<ReconcileState>,
}

impl Reconciler {
    pub fn new(
        cache: CacheRepo,
        cdn: Arc<dyn Store>,
        archive: Arc<dyn Store>,
        renderer: Arc<dyn Renderer>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            cache,
            cdn,
            archive,
            renderer,
            settings,
            state: Mutex::new(ReconcileState::Idle),
        }
    }

    pub fn cache(&self) -> &CacheRepo {
        &self.cache
    }

    /// State of the most recent invocation.
    ///
    /// There is one state per reconciler, not per call: with overlapping
    /// invocations this reports whichever one transitioned last. Callers that
    /// need a per-call result use the returned outcome instead.
    pub fn state(&self) -> ReconcileState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ReconcileState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "Reconciler state change");
        *state = next;
    }

    /// Release the shared cache connection
    pub async fn close(&self) {
        self.cache.close().await;
    }

    /// Partition the expected timestamps for `params` into existing and missing
    pub async fn scan(
        &self,
        params: &ScanParams,
        force_rescan: bool,
        callbacks: &Callbacks,
    ) -> ApiResult<ScanOutcome> {
        self.set_state(ReconcileState::Scanning);
        let outcome = self.run_scan(params, force_rescan, callbacks).await;
        self.set_state(match &outcome {
            Ok(ScanOutcome::Completed(_)) => ReconcileState::Done,
            Ok(ScanOutcome::Cancelled) => ReconcileState::Cancelled,
            Err(_) => ReconcileState::Error,
        });
        outcome
    }

    /// Fetch every timestamp in `missing` into `destination`; failures are per item
    pub async fn fetch_missing_files(
        &self,
        missing: &BTreeSet<DateTime<Utc>>,
        satellite: SatellitePattern,
        destination: &Path,
        callbacks: &Callbacks,
    ) -> FetchReport {
        self.set_state(ReconcileState::Fetching);
        let report = self.run_fetch(missing, satellite, destination, callbacks).await;
        self.set_state(if report.cancelled {
            ReconcileState::Cancelled
        } else {
            ReconcileState::Done
        });
        report
    }

    /// Scan then fetch into the scanned directory.
    ///
    /// On success `total_expected == existing_count + fetched_count` unless some
    /// fetches failed; those stay available through `summary.fetch`.
    pub async fn reconcile(
        &self,
        params: &ScanParams,
        force_rescan: bool,
        callbacks: &Callbacks,
    ) -> ApiResult<ReconcileOutcome> {
        self.set_state(ReconcileState::Scanning);
        callbacks.progress(
            0,
            2,
            &format!(
                "Phase 1/2: Scanning {} for {} images",
                params.directory.display(),
                params.satellite
            ),
        );

        let mut scan = match self.run_scan(params, force_rescan, callbacks).await {
            Ok(ScanOutcome::Completed(scan)) => scan,
            Ok(ScanOutcome::Cancelled) => return Ok(self.cancelled()),
            Err(e) => {
                self.set_state(ReconcileState::Error);
                return Err(e);
            }
        };

        if callbacks.is_cancelled() {
            return Ok(self.cancelled());
        }

        self.set_state(ReconcileState::Fetching);
        callbacks.progress(
            1,
            2,
            &format!(
                "Phase 2/2: Fetching {} missing of {} expected images",
                scan.missing.len(),
                scan.total_expected()
            ),
        );

        let (total_expected, existing_count) = (scan.total_expected(), scan.existing.len());
        let fetch = self
            .run_fetch(&scan.missing, params.satellite, &params.directory, callbacks)
            .await;

        // Keep the memo in step with what is now on disk so a repeat run skips it
        let fetched: Vec<DateTime<Utc>> = fetch
            .results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(ts, _)| *ts)
            .collect();
        if !fetched.is_empty() {
            scan.mark_fetched(fetched);
            self.cache.store_scan_results(&scan::memo_key(params), &scan).await;
        }

        if fetch.cancelled {
            return Ok(self.cancelled());
        }

        let summary = ReconcileSummary {
            total_expected,
            existing_count,
            fetched_count: fetch.succeeded(),
            fetch,
        };

        info!(
            total_expected = summary.total_expected,
            existing = summary.existing_count,
            fetched = summary.fetched_count,
            failed = summary.fetch.failures().len(),
            "Reconciliation finished"
        );
        callbacks.progress(
            2,
            2,
            &format!(
                "Reconciliation complete: {} existing, {} fetched, {} failed",
                summary.existing_count,
                summary.fetched_count,
                summary.fetch.failures().len()
            ),
        );

        self.set_state(ReconcileState::Done);
        Ok(ReconcileOutcome::Completed(summary))
    }

    fn cancelled(&self) -> ReconcileOutcome {
        info!("Reconciliation cancelled");
        self.set_state(ReconcileState::Cancelled);
        ReconcileOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::errors::ApiError;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_reconcile_fetches_every_missing_item() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0, 20, 40]);
        let reconciler = fx.reconciler(ReconcileSettings::default());

        let outcome = reconciler
            .reconcile(&fx.params(base, 60, 10), false, &Callbacks::new())
            .await
            .unwrap();

        let ReconcileOutcome::Completed(summary) = outcome else {
            panic!("reconcile was cancelled");
        };
        assert_eq!(
            (summary.total_expected, summary.existing_count, summary.fetched_count),
            (7, 3, 4)
        );
        assert_eq!(fx.cdn.download_calls().len(), 4);
        assert!(fx.archive.exists_calls().is_empty());
        assert_eq!(reconciler.state(), ReconcileState::Done);
    }

    #[tokio::test]
    async fn test_repeat_reconcile_does_not_refetch() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0, 20, 40]);
        let reconciler = fx.reconciler(ReconcileSettings::default());
        let params = fx.params(base, 60, 10);

        reconciler.reconcile(&params, false, &Callbacks::new()).await.unwrap();
        let ReconcileOutcome::Completed(second) = reconciler
            .reconcile(&params, false, &Callbacks::new())
            .await
            .unwrap()
        else {
            panic!("reconcile was cancelled");
        };

        assert_eq!(fx.cdn.download_calls().len(), 4);
        assert_eq!(
            (second.total_expected, second.existing_count, second.fetched_count),
            (7, 7, 0)
        );
        assert_eq!(fx.cache.stats().await.unwrap().scan_count, 1);
    }

    #[tokio::test]
    async fn test_memo_keeps_items_that_failed_to_fetch() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0, 20, 40]);
        let absent = base + Duration::minutes(30);
        fx.cdn.mark_absent(absent);
        let reconciler = fx.reconciler(ReconcileSettings::default());
        let params = fx.params(base, 60, 10);

        reconciler.reconcile(&params, false, &Callbacks::new()).await.unwrap();
        let ScanOutcome::Completed(memo) = reconciler.scan(&params, false, &Callbacks::new()).await.unwrap() else {
            panic!("scan was cancelled");
        };

        assert_eq!(memo.source, crate::domain::ScanSource::Cache);
        assert_eq!(memo.missing, [absent].into_iter().collect());
        assert_eq!(memo.existing.len(), 6);
    }

    #[tokio::test]
    async fn test_reconcile_degrades_on_remote_not_found() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0, 20, 40]);
        let absent = base + Duration::minutes(30);
        fx.cdn.mark_absent(absent);
        let reconciler = fx.reconciler(ReconcileSettings::default());

        let ReconcileOutcome::Completed(summary) = reconciler
            .reconcile(&fx.params(base, 60, 10), false, &Callbacks::new())
            .await
            .unwrap()
        else {
            panic!("reconcile was cancelled");
        };

        assert_eq!(summary.fetched_count, 3);
        assert!(matches!(
            summary.fetch.results.get(&absent),
            Some(Err(FetchError::NotFound { .. }))
        ));
        assert!(!fx.cdn.download_calls().contains(&absent));
    }

    #[tokio::test]
    async fn test_cancel_during_scan_issues_no_fetches() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0, 20, 40]);
        let reconciler = fx.reconciler(ReconcileSettings::default());

        // First poll (before the directory walk) passes, the next one cancels
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let callbacks = Callbacks::new().cancel_when(move || counter.fetch_add(1, Ordering::SeqCst) >= 1);

        let outcome = reconciler
            .reconcile(&fx.params(base, 60, 10), false, &callbacks)
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Cancelled));
        assert_eq!(reconciler.state(), ReconcileState::Cancelled);
        assert!(fx.cdn.exists_calls().is_empty());
        assert!(fx.archive.exists_calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_reports_both_phases() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0]);
        let reconciler = fx.reconciler(ReconcileSettings::default());

        let messages = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&messages);
        let callbacks = Callbacks::new().on_progress(move |_, _, msg| {
            sink.lock().unwrap().push(msg.to_string());
        });

        reconciler
            .reconcile(&fx.params(base, 20, 10), false, &callbacks)
            .await
            .unwrap();

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|m| m.starts_with("Phase 1/2")));
        assert!(messages.iter().any(|m| m.starts_with("Phase 2/2")));
        assert!(messages.iter().any(|m| m.starts_with("Step 1/6")));
    }

    #[tokio::test]
    async fn test_state_follows_latest_invocation() {
        let fx = Fixture::new().await;
        let base = recent_base();
        fx.touch(base, &[0]);
        let reconciler = fx.reconciler(ReconcileSettings::default());

        reconciler
            .reconcile(&fx.params(base, 10, 10), false, &Callbacks::new())
            .await
            .unwrap();
        assert_eq!(reconciler.state(), ReconcileState::Done);

        let mut broken = fx.params(base, 10, 10);
        broken.directory = fx.dir.path().join("gone");
        assert!(reconciler.scan(&broken, false, &Callbacks::new()).await.is_err());
        assert_eq!(reconciler.state(), ReconcileState::Error);
    }

    #[tokio::test]
    async fn test_missing_directory_is_error_state() {
        let fx = Fixture::new().await;
        let reconciler = fx.reconciler(ReconcileSettings::default());
        let mut params = fx.params(recent_base(), 60, 10);
        params.directory = fx.dir.path().join("does-not-exist");

        let err = reconciler
            .reconcile(&params, false, &Callbacks::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::DirectoryNotFound(_)));
        assert_eq!(reconciler.state(), ReconcileState::Error);
    }
}
