use anyhow::{Context, Result};
use axum::Router;
use file_vault::{
    config::{AppConfig, BackendConfig},
    routes,
    services::{
        file_service::FileService,
        notifications::Notifier,
        path_index::PathIndex,
        storage::{ObjectBackend, ObjectStorage, local::LocalBackend, remote::RemoteBackend},
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
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

    tracing::info!("Starting file-vault with config: {:?}", cfg);

    // --- Initialize SQLite path index ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Create parent directory if needed
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(':') {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("invalid database url {}", db_url))?
        .create_if_missing(true)
        .foreign_keys(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );
    let index = PathIndex::new(db);

    // Schema is idempotent, so it is applied on every start.
    let statements = index.migrate().await?;
    tracing::info!("Applied {} migration statements", statements);

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Select object backend ---
    let backend: Arc<dyn ObjectBackend> = match &cfg.backend {
        BackendConfig::Local { storage_dir } => {
            if !Path::new(storage_dir).exists() {
                fs::create_dir_all(storage_dir)?;
                tracing::info!("Created storage directory at {}", storage_dir);
            }
            Arc::new(LocalBackend::new(storage_dir.clone()))
        }
        BackendConfig::S3(settings) => Arc::new(
            RemoteBackend::s3(settings).context("could not configure the S3 backend")?,
        ),
    };

    // --- Initialize core service ---
    let storage = ObjectStorage::new(backend, cfg.timeouts);
    let service = FileService::new(
        storage,
        index,
        Notifier::default(),
        cfg.sweep_probability,
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

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
