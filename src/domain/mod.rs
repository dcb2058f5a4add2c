/// Domain models for the application
use crate::errors::{ApiError, FetchError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Satellite / product family; drives filename templates and remote layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SatellitePattern {
    Goes16,
    Goes18,
    Generic,
}

impl SatellitePattern {
    /// Lowercase identifier used in local filenames and the cache
    pub fn short_name(&self) -> &'static str {
        match self {
            SatellitePattern::Goes16 => "goes16",
            SatellitePattern::Goes18 => "goes18",
            SatellitePattern::Generic => "generic",
        }
    }

    /// Directory name on the NESDIS CDN
    pub fn cdn_code(&self) -> Option<&'static str> {
        match self {
            SatellitePattern::Goes16 => Some("GOES16"),
            SatellitePattern::Goes18 => Some("GOES18"),
            SatellitePattern::Generic => None,
        }
    }

    /// Public NOAA bucket holding the archival L1b products
    pub fn s3_bucket(&self) -> Option<&'static str> {
        match self {
            SatellitePattern::Goes16 => Some("noaa-goes16"),
            SatellitePattern::Goes18 => Some("noaa-goes18"),
            SatellitePattern::Generic => None,
        }
    }

    /// Platform id embedded in archive object keys (`_G16_`)
    pub fn platform_id(&self) -> Option<&'static str> {
        match self {
            SatellitePattern::Goes16 => Some("G16"),
            SatellitePattern::Goes18 => Some("G18"),
            SatellitePattern::Generic => None,
        }
    }
}

impl fmt::Display for SatellitePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for SatellitePattern {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "goes16" | "g16" | "goeseast" => Ok(SatellitePattern::Goes16),
            "goes18" | "g18" | "goeswest" => Ok(SatellitePattern::Goes18),
            "generic" => Ok(SatellitePattern::Generic),
            other => Err(ApiError::InvalidInput(format!(
                "unknown satellite '{}'",
                other
            ))),
        }
    }
}

/// Full parameter tuple identifying a scan; also the scan memo key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub directory: PathBuf,
    pub satellite: SatellitePattern,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 0 requests auto-detection from the files on disk
    pub interval_minutes: i64,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl ScanParams {
    pub fn new(
        directory: impl Into<PathBuf>,
        satellite: SatellitePattern,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_minutes: i64,
    ) -> Self {
        Self {
            directory: directory.into(),
            satellite,
            start,
            end,
            interval_minutes,
            options: BTreeMap::new(),
        }
    }

    /// Canonical JSON for the options map; key order never affects equality
    pub fn options_json(&self) -> String {
        serde_json::to_string(&self.options).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Expected-but-absent timestamp together with the filename it should have
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    pub timestamp: DateTime<Utc>,
    pub expected_filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    Filesystem,
    Cache,
}

/// Partition of the expected timestamp set into existing and missing
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub existing: BTreeSet<DateTime<Utc>>,
    pub missing: BTreeSet<DateTime<Utc>>,
    pub missing_items: Vec<MissingItem>,
    pub interval_minutes: i64,
    pub source: ScanSource,
}

impl ScanResult {
    pub fn total_expected(&self) -> usize {
        self.existing.len() + self.missing.len()
    }

    /// Move timestamps that have since been fetched from missing to existing
    pub fn mark_fetched<I: IntoIterator<Item = DateTime<Utc>>>(&mut self, fetched: I) {
        for ts in fetched {
            if self.missing.remove(&ts) {
                self.existing.insert(ts);
            }
        }
        let missing = &self.missing;
        self.missing_items.retain(|item| missing.contains(&item.timestamp));
    }
}

/// Scans either complete or are cancelled; a cancelled scan carries no partition
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanResult),
    Cancelled,
}

/// Memoized whole-scan result as persisted in the `scans` table
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub satellite: SatellitePattern,
    pub interval_minutes: i64,
    /// Interval actually used; differs from `interval_minutes` when auto-detected
    pub resolved_interval: i64,
    pub base_dir: String,
    pub total_expected: i64,
    pub total_found: i64,
    pub scan_time: DateTime<Utc>,
    pub missing: Vec<MissingItem>,
}

/// Row of the `timestamps` table
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub timestamp: DateTime<Utc>,
    pub satellite: SatellitePattern,
    pub file_path: Option<String>,
    pub found: bool,
    pub last_checked: DateTime<Utc>,
}

/// Diagnostic snapshot of the cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub scan_count: i64,
    pub timestamp_count: i64,
    pub found_count: i64,
    pub db_size: i64,
    pub last_scan: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub schema_version: Option<i64>,
}

/// Per-timestamp outcome of one fetch call
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub results: BTreeMap<DateTime<Utc>, Result<PathBuf, FetchError>>,
    /// Set when cancellation stopped dispatch before every item was attempted
    pub cancelled: bool,
}

impl FetchReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failures(&self) -> BTreeMap<DateTime<Utc>, FetchError> {
        self.results
            .iter()
            .filter_map(|(ts, r)| r.as_ref().err().map(|e| (*ts, e.clone())))
            .collect()
    }
}

/// Aggregate counts of a finished reconciliation
#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub total_expected: usize,
    pub existing_count: usize,
    pub fetched_count: usize,
    pub fetch: FetchReport,
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Completed(ReconcileSummary),
    Cancelled,
}

/// Lifecycle of a single reconciler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Idle,
    Scanning,
    Fetching,
    Done,
    Cancelled,
    Error,
}

impl ReconcileState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconcileState::Done | ReconcileState::Cancelled | ReconcileState::Error
        )
    }
}

/// Health check response
#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub now: DateTime<Utc>,
}
