/// HTTP request handlers
use crate::domain::{
    CacheStats, Health, ReconcileOutcome, SatellitePattern, ScanOutcome, ScanParams,
};
use crate::errors::{ApiError, ErrorCategory};
use crate::services::{Callbacks, Reconciler};
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

/// Successful response wrapper
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub ok: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { ok: true, data }
    }
}

/// Body accepted by the scan and reconcile endpoints
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub directory: PathBuf,
    pub satellite: SatellitePattern,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub interval_minutes: i64,
    #[serde(default)]
    pub force_rescan: bool,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl ScanRequest {
    fn params(&self) -> ScanParams {
        let mut params = ScanParams::new(
            self.directory.clone(),
            self.satellite,
            self.start,
            self.end,
            self.interval_minutes,
        );
        params.options = self.options.clone();
        params
    }
}

#[derive(Debug, Deserialize)]
pub struct TimestampQuery {
    pub satellite: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Serialize)]
struct FailureView {
    timestamp: DateTime<Utc>,
    category: ErrorCategory,
    error: String,
}

/// Progress and item events become log lines for HTTP callers
fn logging_callbacks() -> Callbacks {
    Callbacks::new()
        .on_progress(|current, total, message| info!(current, total, "{}", message))
        .on_item(|path, success| {
            if !success {
                warn!(path = %path.display(), "Item not fetched");
            }
        })
}

/// Health check handler
pub async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        now: Utc::now(),
    })
}

/// Current reconciler state; shared by all requests, so it reflects the latest transition
pub async fn get_status(State(state): State<AppState>) -> Json<Value> {
    let current = state.reconciler.state();
    Json(serde_json::json!(SuccessResponse::new(serde_json::json!({
        "state": current,
        "finished": current.is_terminal(),
    }))))
}

/// Scan a directory for missing timestamps
pub async fn scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .reconciler
        .scan(&req.params(), req.force_rescan, &logging_callbacks())
        .await?;

    let body = match outcome {
        ScanOutcome::Cancelled => serde_json::json!({ "status": "cancelled" }),
        ScanOutcome::Completed(result) => serde_json::json!({
            "status": "completed",
            "source": result.source,
            "interval_minutes": result.interval_minutes,
            "total_expected": result.total_expected(),
            "existing_count": result.existing.len(),
            "missing_count": result.missing.len(),
            "missing": result.missing_items,
        }),
    };
    Ok(Json(serde_json::json!(SuccessResponse::new(body))))
}

/// Scan then fetch everything missing
pub async fn reconcile(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .reconciler
        .reconcile(&req.params(), req.force_rescan, &logging_callbacks())
        .await?;

    let body = match outcome {
        ReconcileOutcome::Cancelled => serde_json::json!({ "status": "cancelled" }),
        ReconcileOutcome::Completed(summary) => {
            let failures: Vec<FailureView> = summary
                .fetch
                .failures()
                .into_iter()
                .map(|(timestamp, e)| FailureView {
                    timestamp,
                    category: e.category(),
                    error: e.to_string(),
                })
                .collect();
            serde_json::json!({
                "status": "completed",
                "total_expected": summary.total_expected,
                "existing_count": summary.existing_count,
                "fetched_count": summary.fetched_count,
                "failures": failures,
            })
        }
    };
    Ok(Json(serde_json::json!(SuccessResponse::new(body))))
}

/// Cache diagnostics
pub async fn cache_stats(
    State(state): State<AppState>,
) -> Result<Json<SuccessResponse<CacheStats>>, ApiError> {
    let stats = state.reconciler.cache().stats().await?;
    Ok(Json(SuccessResponse::new(stats)))
}

/// Wipe the cache; explicit user action only
pub async fn clear_cache(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.reconciler.cache().clear_cache().await?;
    Ok(Json(serde_json::json!(SuccessResponse::new(serde_json::json!({
        "cleared": true
    })))))
}

/// Cached timestamps known to exist locally
pub async fn cached_timestamps(
    Query(query): Query<TimestampQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let satellite: SatellitePattern = query.satellite.parse()?;
    let timestamps = state
        .reconciler
        .cache()
        .get_timestamps(satellite, query.start, query.end)
        .await;

    Ok(Json(serde_json::json!(SuccessResponse::new(serde_json::json!({
        "satellite": satellite,
        "count": timestamps.len(),
        "timestamps": timestamps,
    })))))
}
