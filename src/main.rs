use anyhow::{Context, Result};
use axum::Router;
use image_cache::{
    config::AppConfig,
    metadata,
    routes,
    services::{
        blob_store::{BlobStore, FsBlobStore},
        cache_service::CacheService,
        gc_service::GcScheduler,
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-cache with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Metadata backend (schema is created on connect) ---
    let store = metadata::connect(&cfg.metadata)
        .await
        .with_context(|| format!("opening {} metadata store", cfg.metadata.backend))?;

    // --- Handle migration mode ---
    if migrate {
        store.migrate().await.context("running metadata migrations")?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&cfg.storage_dir));
    let cache = CacheService::new(store, blobs, cfg.cache_config());
    let gc = GcScheduler::new(cache.clone(), cfg.gc_config());
    let gc_task = gc.clone().spawn(cfg.gc_check_interval());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState::new(cache, gc));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app).await;
    gc_task.abort();
    served?;

    Ok(())
}
