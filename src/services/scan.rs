//! Local directory scan: expected set minus what is already on disk
use super::{Callbacks, Reconciler};
use crate::domain::{MissingItem, SatellitePattern, ScanOutcome, ScanParams, ScanRecord, ScanResult, ScanSource};
use crate::errors::{ApiError, ApiResult};
use crate::timeindex::{detect_interval, expected_filename, generate_sequence, normalize_range, truncate};
use crate::utils::{is_image_file, timestamp_from_filename};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const SCAN_STEPS: usize = 6;

fn step(callbacks: &Callbacks, k: usize, percent: usize, message: &str) {
    callbacks.progress(percent, 100, &format!("Step {}/{}: {}", k, SCAN_STEPS, message));
}

/// Recursively collect image files whose names carry a timestamp within `[start, end]`.
///
/// Symlinks are not followed, so a link back to an ancestor cannot loop the walk.
fn walk_directory(
    root: &Path,
    satellite: SatellitePattern,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> std::io::Result<BTreeMap<DateTime<Utc>, PathBuf>> {
    let mut found = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() > 0 => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable entry");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !entry.file_type().is_file() || !is_image_file(entry.path()) {
            continue;
        }
        let Some(ts) = entry
            .file_name()
            .to_str()
            .and_then(|n| timestamp_from_filename(n, satellite))
        else {
            continue;
        };
        if ts < start || ts > end {
            continue;
        }
        // Keep the smallest path for a stable result
        let path = entry.into_path();
        match found.get(&ts) {
            Some(kept) if *kept <= path => {}
            _ => {
                found.insert(ts, path);
            }
        }
    }

    Ok(found)
}

fn partition(
    expected: &[DateTime<Utc>],
    found: &BTreeSet<DateTime<Utc>>,
    satellite: SatellitePattern,
) -> (BTreeSet<DateTime<Utc>>, BTreeSet<DateTime<Utc>>, Vec<MissingItem>) {
    let mut existing = BTreeSet::new();
    let mut missing = BTreeSet::new();
    let mut missing_items = Vec::new();

    for ts in expected {
        if found.contains(ts) {
            existing.insert(*ts);
        } else {
            missing.insert(*ts);
            missing_items.push(MissingItem {
                timestamp: *ts,
                expected_filename: expected_filename(*ts, satellite),
            });
        }
    }

    (existing, missing, missing_items)
}

/// Rebuild a scan result from its memo record
fn from_record(record: ScanRecord) -> Option<ScanResult> {
    let expected = generate_sequence(record.start, record.end, record.resolved_interval).ok()?;
    let missing: BTreeSet<DateTime<Utc>> = record.missing.iter().map(|m| m.timestamp).collect();
    let existing = expected
        .iter()
        .copied()
        .filter(|ts| !missing.contains(ts))
        .collect();

    Some(ScanResult {
        existing,
        missing,
        missing_items: record.missing,
        interval_minutes: record.resolved_interval,
        source: ScanSource::Cache,
    })
}

/// Parameters as memoized: range truncated and put in order
pub(super) fn memo_key(params: &ScanParams) -> ScanParams {
    let (start, end) = normalize_range(params.start, params.end);
    ScanParams {
        start,
        end,
        ..params.clone()
    }
}

impl Reconciler {
    pub(super) async fn run_scan(
        &self,
        params: &ScanParams,
        force_rescan: bool,
        callbacks: &Callbacks,
    ) -> ApiResult<ScanOutcome> {
        if params.interval_minutes < 0 {
            return Err(ApiError::InvalidRange(format!(
                "interval must be positive or 0 for auto-detect, got {}",
                params.interval_minutes
            )));
        }
        let params = memo_key(params);
        let (start, end) = (params.start, params.end);
        let satellite = params.satellite;

        if !force_rescan {
            if let Some(result) = self
                .cache
                .get_cached_scan(&params)
                .await
                .and_then(from_record)
            {
                info!(
                    missing = result.missing.len(),
                    existing = result.existing.len(),
                    "Scan served from memo"
                );
                callbacks.progress(
                    100,
                    100,
                    &format!(
                        "Loaded cached scan: {} existing, {} missing",
                        result.existing.len(),
                        result.missing.len()
                    ),
                );
                return Ok(ScanOutcome::Completed(result));
            }
        }

        let directory = params.directory.clone();
        match tokio::fs::metadata(&directory).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(ApiError::DirectoryNotFound(directory)),
        }
        step(callbacks, 1, 0, &format!("Validated {}", directory.display()));

        if callbacks.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }
        step(callbacks, 2, 20, &format!("Scanning directory for {} images", satellite));
        let root = directory.clone();
        let on_disk = tokio::task::spawn_blocking(move || walk_directory(&root, satellite, start, end))
            .await
            .map_err(|e| ApiError::Internal(format!("directory walk failed: {}", e)))??;

        if callbacks.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }
        step(callbacks, 3, 30, &format!("Found {} local files, checking cache", on_disk.len()));
        let mut found: BTreeSet<DateTime<Utc>> = on_disk.keys().copied().collect();
        let mut cached = BTreeSet::new();
        for entry in self.cache.get_entries(satellite, start, end).await {
            let Some(path) = entry.file_path.as_deref().map(Path::new) else {
                continue;
            };
            if path.starts_with(&directory) && path.is_file() {
                cached.insert(entry.timestamp);
                found.insert(truncate(entry.timestamp));
            }
        }
        for (ts, path) in &on_disk {
            if !cached.contains(ts) {
                self.cache
                    .add_timestamp(*ts, satellite, Some(&*path.to_string_lossy()), true)
                    .await;
            }
        }

        if callbacks.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }
        let interval = match params.interval_minutes {
            0 => {
                let detected = detect_interval(found.iter());
                info!(interval = detected, "Auto-detected interval");
                detected
            }
            n => n,
        };
        step(
            callbacks,
            4,
            40,
            &format!("Generating expected timestamps every {} minutes", interval),
        );
        let expected = generate_sequence(start, end, interval)?;

        if callbacks.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }
        let (existing, missing, missing_items) = partition(&expected, &found, satellite);
        step(
            callbacks,
            5,
            70,
            &format!("{} of {} expected timestamps missing", missing.len(), expected.len()),
        );

        if callbacks.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }
        let result = ScanResult {
            existing,
            missing,
            missing_items,
            interval_minutes: interval,
            source: ScanSource::Filesystem,
        };
        step(callbacks, 6, 90, "Saving scan results");
        self.cache.store_scan_results(&params, &result).await;

        info!(
            directory = %directory.display(),
            %satellite,
            expected = expected.len(),
            existing = result.existing.len(),
            missing = result.missing.len(),
            "Scan complete"
        );
        callbacks.progress(
            100,
            100,
            &format!(
                "Scan complete: {} existing, {} missing",
                result.existing.len(),
                result.missing.len()
            ),
        );
        Ok(ScanOutcome::Completed(result))
    }
}
