use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use vecbase::api::{create_router, AppState};
use vecbase::constants::{
    default_data_dir, DEFAULT_LISTEN_ADDR, LOG_DIR_NAME, LOG_FILE_NAME, SNAPSHOT_FILE_NAME,
};
use vecbase::service::VectorService;
use vecbase::snapshot;

/// In-process vector database with per-library pluggable ANN indexes
#[derive(Parser, Debug)]
#[command(name = "vecbase", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Data directory for the snapshot and logs (default: ~/.vecbase)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Disable snapshot persistence (start empty, never write to disk)
    #[arg(long)]
    ephemeral: bool,

    /// Disable the rolling log file (stdout only)
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => default_data_dir()?,
    };

    // Stdout layer always; daily-rolling file layer unless disabled.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vecbase=info,tower_http=info".into());
    let stdout_layer = tracing_subscriber::fmt::layer().compact();

    let _file_guard = if args.no_log_file {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .init();
        None
    } else {
        let log_dir = data_dir.join(LOG_DIR_NAME);
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .compact();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .with(file_layer)
            .init();
        Some(guard)
    };

    let snapshot_path = (!args.ephemeral).then(|| data_dir.join(SNAPSHOT_FILE_NAME));

    let service = Arc::new(VectorService::new());
    if let Some(path) = &snapshot_path {
        if snapshot::load(&service.stores(), path)? {
            service.rebuild_all_indexes().await?;
        }
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.cancel();
        })?;
    }

    let addr: SocketAddr = args.listen.parse()?;
    let state = AppState::new(service.clone(), snapshot_path.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        listen = %addr,
        data_dir = %data_dir.display(),
        persistent = snapshot_path.is_some(),
        "vecbase listening"
    );

    let shutdown_wait = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_wait.cancelled().await })
        .await?;

    if let Some(path) = &snapshot_path {
        if let Err(e) = snapshot::save(&service.stores(), path) {
            warn!(%e, "failed to save snapshot on shutdown");
        }
    }

    info!("vecbase shutdown complete");
    Ok(())
}
