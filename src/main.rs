use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod storage;

use config::{AppConfig, BackendKind, RunMode};
use services::{
    audio_probe::SymphoniaProber,
    delivery_service::{DeliveryService, SqliteAccessLog, SqliteMediaRegistry},
    reaper::UploadReaper,
    remote_proxy::RemoteMediaProxy,
    upload_service::UploadService,
};
use storage::{FilesystemBackend, ObjectStoreBackend, S3MultipartApi, StorageBackend};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection + schema ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backend ---
    let storage: Arc<dyn StorageBackend> = match cfg.backend {
        BackendKind::Filesystem => Arc::new(FilesystemBackend::new(&cfg.storage_dir)),
        BackendKind::S3 => {
            let settings = cfg
                .s3
                .as_ref()
                .context("s3 backend selected without s3 settings")?;
            let api = S3MultipartApi::from_settings(settings).await;
            Arc::new(ObjectStoreBackend::new(
                Arc::new(api),
                db.clone(),
                settings.prefix.clone(),
            ))
        }
    };
    tracing::info!("Using {} storage backend", storage.name());

    // --- Expired upload reclamation ---
    let reaper = UploadReaper::new(
        db.clone(),
        storage.clone(),
        Duration::from_secs(cfg.upload_ttl_secs),
    );
    if mode == RunMode::Sweep {
        let reclaimed = reaper.sweep().await?;
        tracing::info!("Sweep complete: reclaimed {} expired uploads.", reclaimed);
        return Ok(());
    }
    if cfg.reap_interval_secs > 0 {
        let _sweeper = reaper.spawn_periodic(Duration::from_secs(cfg.reap_interval_secs));
    }

    // --- Initialize core services ---
    let uploads = UploadService::new(db.clone(), storage, Arc::new(SymphoniaProber));
    let proxy = RemoteMediaProxy::new(Duration::from_secs(cfg.upstream_timeout_secs))?;
    let delivery = DeliveryService::new(
        Arc::new(SqliteMediaRegistry::new(db.clone())),
        Arc::new(SqliteAccessLog::new(db.clone())),
        proxy,
        &cfg.media_root,
    );
    let state = state::AppState {
        db,
        uploads,
        delivery,
        storage_dir: cfg.storage_dir.clone().into(),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_chunk_bytes).with_state(state);

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
    axum::serve(listener, app).await?;

    Ok(())
}
