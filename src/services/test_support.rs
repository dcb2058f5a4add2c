//! In-memory stores and a temp-directory fixture shared by the service tests
use super::Reconciler;
use crate::clients::{Renderer, Store};
use crate::config::ReconcileSettings;
use crate::domain::{SatellitePattern, ScanParams};
use crate::errors::{ApiError, ApiResult};
use crate::repo::CacheRepo;
use crate::timeindex::expected_filename;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub struct MockStore {
    name: &'static str,
    render: bool,
    delay: std::time::Duration,
    absent: Mutex<HashSet<DateTime<Utc>>>,
    panics: Mutex<HashSet<DateTime<Utc>>>,
    network_failures: AtomicUsize,
    exists_calls: Mutex<Vec<DateTime<Utc>>>,
    download_calls: Mutex<Vec<DateTime<Utc>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockStore {
    pub fn new(name: &'static str, render: bool) -> Self {
        Self {
            name,
            render,
            delay: std::time::Duration::ZERO,
            absent: Mutex::new(HashSet::new()),
            panics: Mutex::new(HashSet::new()),
            network_failures: AtomicUsize::new(0),
            exists_calls: Mutex::new(Vec::new()),
            download_calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn mark_absent(&self, ts: DateTime<Utc>) {
        self.absent.lock().unwrap().insert(ts);
    }

    /// Make the download for `ts` panic inside the worker
    pub fn panic_on(&self, ts: DateTime<Utc>) {
        self.panics.lock().unwrap().insert(ts);
    }

    /// Fail the next `n` existence checks with a transport error
    pub fn fail_next(&self, n: usize) {
        self.network_failures.store(n, Ordering::SeqCst);
    }

    pub fn exists_calls(&self) -> Vec<DateTime<Utc>> {
        self.exists_calls.lock().unwrap().clone()
    }

    pub fn download_calls(&self) -> Vec<DateTime<Utc>> {
        self.download_calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MockStore {
    fn name(&self) -> &str {
        self.name
    }

    fn needs_render(&self) -> bool {
        self.render
    }

    async fn exists(&self, timestamp: DateTime<Utc>, _satellite: SatellitePattern) -> ApiResult<bool> {
        self.exists_calls.lock().unwrap().push(timestamp);
        let inject = self
            .network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(ApiError::Internal("connection reset".to_string()));
        }
        Ok(!self.absent.lock().unwrap().contains(&timestamp))
    }

    async fn download(
        &self,
        timestamp: DateTime<Utc>,
        _satellite: SatellitePattern,
        dest: &Path,
    ) -> ApiResult<PathBuf> {
        self.download_calls.lock().unwrap().push(timestamp);
        if self.panics.lock().unwrap().contains(&timestamp) {
            panic!("store crashed on {}", timestamp);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        let target = if self.render {
            dest.with_extension("nc")
        } else {
            dest.to_path_buf()
        };
        let written = tokio::fs::write(&target, b"image").await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        written?;
        Ok(target)
    }
}

pub struct MockRenderer {
    fail: bool,
    calls: Mutex<Vec<PathBuf>>,
}

impl MockRenderer {
    pub fn new(fail: bool) -> Self {
        Self {
            fail,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, raw: &Path) -> ApiResult<PathBuf> {
        self.calls.lock().unwrap().push(raw.to_path_buf());
        if self.fail {
            return Err(ApiError::Render("unreadable NetCDF".to_string()));
        }
        let output = raw.with_extension("png");
        tokio::fs::write(&output, b"png").await?;
        Ok(output)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub images: PathBuf,
    pub cache: CacheRepo,
    pub cdn: Arc<MockStore>,
    pub archive: Arc<MockStore>,
    pub renderer: Arc<MockRenderer>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_stores(MockStore::new("CDN", false), MockStore::new("S3", true), false).await
    }

    pub async fn with_stores(cdn: MockStore, archive: MockStore, render_fails: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        let cache = CacheRepo::open(&dir.path().join("cache.db")).await.unwrap();
        Self {
            dir,
            images,
            cache,
            cdn: Arc::new(cdn),
            archive: Arc::new(archive),
            renderer: Arc::new(MockRenderer::new(render_fails)),
        }
    }

    pub fn reconciler(&self, settings: ReconcileSettings) -> Reconciler {
        Reconciler::new(
            self.cache.clone(),
            self.cdn.clone(),
            self.archive.clone(),
            self.renderer.clone(),
            settings,
        )
    }

    /// Create GOES-16 images at the given minute offsets from `base`
    pub fn touch(&self, base: DateTime<Utc>, minutes: &[i64]) {
        for m in minutes {
            let name = expected_filename(base + Duration::minutes(*m), SatellitePattern::Goes16);
            std::fs::write(self.images.join(name), b"image").unwrap();
        }
    }

    pub fn params(&self, base: DateTime<Utc>, span_minutes: i64, interval: i64) -> ScanParams {
        ScanParams::new(
            self.images.clone(),
            SatellitePattern::Goes16,
            base,
            base + Duration::minutes(span_minutes),
            interval,
        )
    }
}

/// An hour boundary comfortably inside the recency window
pub fn recent_base() -> DateTime<Utc> {
    (Utc::now() - Duration::hours(3))
        .duration_trunc(Duration::hours(1))
        .unwrap()
}

/// An hour boundary well past the recency window
pub fn archival_base() -> DateTime<Utc> {
    (Utc::now() - Duration::days(30))
        .duration_trunc(Duration::hours(1))
        .unwrap()
}
