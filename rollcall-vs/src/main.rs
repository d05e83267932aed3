//! rollcall-vs (Verification Service)
//!
//! Accepts proximity-gated biometric verifications and serves the attendance
//! ledger over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rollcall_common::api::auth::initialize_shared_secret;
use rollcall_common::config::{RootFolderInitializer, RootFolderResolver};
use rollcall_vs::config::{Overrides, ServiceConfig};
use rollcall_vs::{AppState, ProcessWorker};

#[derive(Debug, Parser)]
#[command(name = "rollcall-vs", version, about = "Attendance verification service")]
struct Args {
    /// Root folder (database, staging directory)
    #[arg(long)]
    root_folder: Option<PathBuf>,

    /// Address to bind (defaults to config)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (defaults to config)
    #[arg(long, env = "ROLLCALL_VS_PORT")]
    port: Option<u16>,

    /// Biometric worker executable (defaults to config)
    #[arg(long)]
    worker: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Step 1: Load config and resolve the root folder
    let resolver = RootFolderResolver::new("rollcall-vs").with_cli_arg(args.root_folder);
    let toml_config = resolver.load_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(toml_config.logging.level.as_str())),
        )
        .init();

    info!(
        "Starting rollcall-vs v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root_folder = resolver.resolve_with(&toml_config);
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let config = ServiceConfig::resolve(
        initializer.root_folder(),
        &toml_config,
        Overrides {
            bind: args.bind,
            port: args.port,
            worker_program: args.worker,
        },
    )?;

    // Step 2: Open or create the database
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = rollcall_common::db::init_database(&db_path).await?;

    let shared_secret = initialize_shared_secret(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize token secret: {}", e))?;

    // Step 3: Worker and application state
    info!(
        program = %config.worker.program,
        staging_dir = %config.worker.staging_dir.display(),
        timeout_ms = config.worker.timeout.as_millis() as u64,
        "Biometric worker configured"
    );
    let worker = Arc::new(ProcessWorker::new(config.worker.clone()));
    let state = AppState::new(db_pool, shared_secret, worker, &config.server);
    let app = rollcall_vs::build_router(state);

    // Step 4: Serve
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("rollcall-vs stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
