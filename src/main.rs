use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::StoreBackend;
use crate::services::archive::Archiver;
use crate::services::folders::FolderTree;
use crate::services::gateway::{Gateway, RetryPolicy};
use crate::services::history::HistoryCatalog;
use crate::services::multipart::UploadCoordinator;
use crate::store::{LocalStore, MemoryStore, ObjectStore};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod store;
#[cfg(test)]
mod test_support;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub folders: FolderTree,
    pub uploads: UploadCoordinator,
    pub archiver: Archiver,
    pub history: HistoryCatalog,
    pub gateway: Gateway,
    pub db: Arc<sqlx::Pool<sqlx::Sqlite>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting drivebox with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if !db_path.starts_with(':') {
        // Create parent directory if needed
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // Try opening manually before SQLx
        match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(db_path)
        {
            Ok(_) => tracing::debug!("Database file can be created/opened."),
            Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    store::local::apply_schema(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize services ---
    let raw_store: Arc<dyn ObjectStore> = match cfg.backend {
        StoreBackend::Local => Arc::new(LocalStore::new(db.clone(), cfg.storage_dir.clone())),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    let retry = RetryPolicy {
        max_attempts: cfg.retry_max_attempts,
        base_delay: Duration::from_millis(cfg.retry_base_ms),
    };
    let gateway = Gateway::new(raw_store, retry);
    let history = HistoryCatalog::new(db.clone());
    let state = AppState {
        folders: FolderTree::new(gateway.clone()),
        uploads: UploadCoordinator::new(
            gateway.clone(),
            cfg.part_size_bytes(),
            cfg.upload_concurrency,
            Some(history.clone()),
        ),
        archiver: Archiver::new(gateway.clone()),
        history,
        gateway,
        db,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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
