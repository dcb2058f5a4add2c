//! Fetch phase: route missing timestamps to a store and download them concurrently
use super::{Callbacks, Reconciler};
use crate::clients::{Renderer, Store};
use crate::domain::{FetchReport, SatellitePattern};
use crate::errors::FetchError;
use crate::repo::CacheRepo;
use crate::timeindex::{expected_filename, is_recent};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Everything one worker needs to resolve a single timestamp
struct FetchJob {
    timestamp: DateTime<Utc>,
    satellite: SatellitePattern,
    dest: PathBuf,
    store: Arc<dyn Store>,
    renderer: Arc<dyn Renderer>,
    cache: CacheRepo,
    callbacks: Callbacks,
    max_retries: u32,
    retry_backoff: Duration,
    tally: Arc<Tally>,
}

/// Shared progress counters across workers
struct Tally {
    total: usize,
    completed: AtomicUsize,
    succeeded: AtomicUsize,
}

impl FetchJob {
    async fn attempt(&self) -> Result<PathBuf, FetchError> {
        let store = self.store.name();
        let present = self
            .store
            .exists(self.timestamp, self.satellite)
            .await
            .map_err(|e| FetchError::from_store(store, e))?;
        if !present {
            return Err(FetchError::NotFound {
                store: store.to_string(),
                timestamp: self.timestamp.to_rfc3339(),
            });
        }

        let raw = self
            .store
            .download(self.timestamp, self.satellite, &self.dest)
            .await
            .map_err(|e| FetchError::from_store(store, e))?;

        if !self.store.needs_render() {
            return Ok(raw);
        }
        self.renderer
            .render(&raw)
            .await
            .map_err(|e| FetchError::Render {
                path: raw.clone(),
                message: e.to_string(),
            })
    }

    async fn run(self) -> (DateTime<Utc>, Result<PathBuf, FetchError>) {
        let mut attempt = 0;
        let result = loop {
            match self.attempt().await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        timestamp = %self.timestamp,
                        store = self.store.name(),
                        attempt,
                        error = %e,
                        "Fetch attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                other => break other,
            }
        };

        self.record(&result).await;
        (self.timestamp, result)
    }

    /// Cache update, item callback and progress for a finished item
    async fn record(&self, result: &Result<PathBuf, FetchError>) {
        match result {
            Ok(path) => {
                self.cache
                    .add_timestamp(self.timestamp, self.satellite, Some(&*path.to_string_lossy()), true)
                    .await;
                self.tally.succeeded.fetch_add(1, Ordering::SeqCst);
                self.callbacks.item(path, true);
            }
            Err(e) => {
                if matches!(e, FetchError::NotFound { .. }) {
                    self.cache
                        .add_timestamp(self.timestamp, self.satellite, None, false)
                        .await;
                }
                warn!(timestamp = %self.timestamp, category = ?e.category(), error = %e, "Fetch failed");
                self.callbacks.item(&self.dest, false);
                self.callbacks.error(self.timestamp, e);
            }
        }

        let done = self.tally.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let ok = self.tally.succeeded.load(Ordering::SeqCst);
        self.callbacks.progress(
            done,
            self.tally.total,
            &format!(
                "Downloaded {}/{} ({} failed) - {} {}",
                ok,
                self.tally.total,
                done - ok,
                self.store.name(),
                self.timestamp.format("%Y-%m-%d %H:%M")
            ),
        );
    }
}

impl Reconciler {
    pub(super) async fn run_fetch(
        &self,
        missing: &BTreeSet<DateTime<Utc>>,
        satellite: SatellitePattern,
        destination: &Path,
        callbacks: &Callbacks,
    ) -> FetchReport {
        let mut report = FetchReport::default();
        let total = missing.len();
        if total == 0 {
            callbacks.progress(0, 0, "Nothing to fetch");
            return report;
        }

        let now = Utc::now();
        let window = self.settings.recent_window_days;
        let (recent, archival): (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>) =
            missing.iter().partition(|ts| is_recent(**ts, now, window));
        info!(
            recent = recent.len(),
            archival = archival.len(),
            window_days = window,
            "Routing missing timestamps"
        );
        callbacks.progress(
            0,
            total,
            &format!(
                "Fetching {} files: {} from {}, {} from {}",
                total,
                recent.len(),
                self.cdn.name(),
                archival.len(),
                self.archive.name()
            ),
        );

        let tally = Arc::new(Tally {
            total,
            completed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
        });
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut dispatched = Vec::with_capacity(total);

        let routed = recent
            .iter()
            .map(|ts| (*ts, &self.cdn))
            .chain(archival.iter().map(|ts| (*ts, &self.archive)));

        for (timestamp, store) in routed {
            if callbacks.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // Waiting for a permit may take a while; look again before dispatching
            if callbacks.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let job = FetchJob {
                timestamp,
                satellite,
                dest: destination.join(expected_filename(timestamp, satellite)),
                store: Arc::clone(store),
                renderer: Arc::clone(&self.renderer),
                cache: self.cache.clone(),
                callbacks: callbacks.clone(),
                max_retries: self.settings.max_retries,
                retry_backoff: self.settings.retry_backoff,
                tally: Arc::clone(&tally),
            };
            dispatched.push((timestamp, job.dest.clone()));
            tasks.spawn(async move {
                let _permit = permit;
                job.run().await
            });
        }

        if report.cancelled {
            info!(
                dispatched = dispatched.len(),
                skipped = total - dispatched.len(),
                "Fetch cancelled, waiting for in-flight downloads"
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((timestamp, result)) => {
                    report.results.insert(timestamp, result);
                }
                Err(e) => error!(error = %e, "Fetch worker aborted"),
            }
        }

        // A worker that panicked never reported back
        for (timestamp, dest) in dispatched {
            if report.results.contains_key(&timestamp) {
                continue;
            }
            let err = FetchError::Internal("fetch worker aborted".to_string());
            callbacks.item(&dest, false);
            callbacks.error(timestamp, &err);
            report.results.insert(timestamp, Err(err));
        }

        info!(
            attempted = report.results.len(),
            succeeded = report.succeeded(),
            cancelled = report.cancelled,
            "Fetch phase finished"
        );
        report
    }
}
