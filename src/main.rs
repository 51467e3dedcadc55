use anyhow::Result;
use media_pipeline::{
    config::AppConfig,
    db,
    pipeline::PipelineEngine,
    routes,
    services::{
        blob_store::{BlobStore, LocalBlobStore},
        cache::MemoryCache,
        dispatcher::TransformDispatcher,
        media_service::{MediaService, MediaSettings},
        metadata_store::{MetadataStore, SqliteMetadataStore},
        queue::{SqliteQueue, TransformQueue},
        retry::RetryPolicy,
        watermark::HttpWatermarkFetcher,
        worker::{TransformWorker, WorkerSettings, spawn_workers},
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-pipeline with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url, DB_MAX_CONNECTIONS).await?;
    db::migrate(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Collaborators ---
    let retry = RetryPolicy::new(cfg.io_retry_attempts, cfg.retry_backoff());
    let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(db.clone()));
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&cfg.storage_dir));
    let cache = Arc::new(MemoryCache::new());
    let queue: Arc<dyn TransformQueue> = Arc::new(SqliteQueue::new(
        db.clone(),
        Duration::from_millis(cfg.queue_poll_ms),
        Duration::from_secs(cfg.visibility_timeout_secs),
        cfg.max_deliveries,
    ));
    let fetcher = Arc::new(HttpWatermarkFetcher::new(Duration::from_secs(
        cfg.watermark_timeout_secs,
    ))?);

    // --- Background workers ---
    let shutdown = CancellationToken::new();
    let worker = TransformWorker::new(
        metadata.clone(),
        blobs.clone(),
        cache.clone(),
        PipelineEngine::new(fetcher, retry),
        retry,
        WorkerSettings {
            blob_domain: cfg.blob_domain.clone(),
            cache_ttl: cfg.cache_ttl(),
            dedupe_in_flight: cfg.dedupe_in_flight,
            lease_ttl: Duration::from_secs(cfg.in_flight_lease_secs),
        },
    );
    let mut tasks = spawn_workers(worker, queue.clone(), cfg.workers, shutdown.clone());
    tasks.push(tokio::spawn(purge_expired(
        cache.clone(),
        cfg.cache_ttl(),
        shutdown.clone(),
    )));

    // --- Build router ---
    let state = AppState {
        media: MediaService::new(
            metadata.clone(),
            blobs,
            cache,
            retry,
            MediaSettings {
                blob_domain: cfg.blob_domain.clone(),
                cache_ttl: cfg.cache_ttl(),
                max_upload_bytes: cfg.max_upload_bytes,
            },
        ),
        dispatcher: TransformDispatcher::new(metadata, queue, retry),
    };
    let app = routes::routes::routes().with_state(state);

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
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_ctrl_c(shutdown.clone()))
        .await?;

    // --- Drain workers ---
    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!("background task ended abnormally: {}", err);
        }
    }
    db.close().await;
    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested."),
        Err(err) => {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            shutdown.cancelled().await;
        }
    }
    shutdown.cancel();
}

/// Periodically drop expired cache entries.
async fn purge_expired(cache: Arc<MemoryCache>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!("purged {} expired cache entries", purged);
                }
            }
        }
    }
}
