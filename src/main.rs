/// GOES archive reconciliation service entry point
mod clients;
mod config;
mod domain;
mod errors;
mod handlers;
mod repo;
mod routes;
mod services;
mod timeindex;
mod utils;

use crate::clients::{ArchiveStore, CdnStore, CommandRenderer, PassthroughRenderer, Renderer};
use crate::config::AppConfig;
use crate::handlers::AppState;
use crate::repo::CacheRepo;
use crate::routes::build_router;
use crate::services::Reconciler;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    // Load configuration
    let config = AppConfig::from_env()?;
    info!(
        window_days = config.reconcile.recent_window_days,
        max_concurrency = config.reconcile.max_concurrency,
        "Configuration loaded successfully"
    );

    // Open the shared cache
    let cache = CacheRepo::open(&config.cache_db_path).await?;

    // Initialize stores
    let cdn = Arc::new(CdnStore::new(config.cdn_base_url.clone(), config.http_timeout)?);
    let archive = Arc::new(
        ArchiveStore::new(config.archive_endpoint_url.clone(), config.http_timeout).await,
    );
    let renderer: Arc<dyn Renderer> = match &config.render_command {
        Some(cmd) => {
            info!(command = %cmd, "Using external renderer for archive files");
            Arc::new(CommandRenderer::from_command_line(cmd)?)
        }
        None => Arc::new(PassthroughRenderer),
    };

    let reconciler = Arc::new(Reconciler::new(
        cache,
        cdn,
        archive,
        renderer,
        config.reconcile.clone(),
    ));

    let state = AppState {
        reconciler: reconciler.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("goes_reconcile listening on {}", config.listen_addr);

    axum::serve(listener, app.into_make_service()).await?;

    reconciler.close().await;
    Ok(())
}
