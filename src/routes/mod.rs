/// Application routes configuration
use crate::handlers::{
    cache_stats, cached_timestamps, clear_cache, get_status, health, reconcile, scan, AppState,
};
use axum::{
    routing::{get, post},
    Router,
};

/// Build the application router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/status", get(get_status))
        // Reconciliation endpoints
        .route("/scan", post(scan))
        .route("/reconcile", post(reconcile))
        // Cache endpoints
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/timestamps", get(cached_timestamps))
        .with_state(state)
}
