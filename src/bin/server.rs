#![forbid(unsafe_code)]

//! HTTP server plus the background maintenance loops.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use redstream::{
    api::{AppState, router},
    config::{ExecutionMode, load_service_config},
    index::SessionIndex,
    lifecycle::SessionManager,
    logging::init_logging,
    orchestrator::DownloadOrchestrator,
    scheduler::{Maintenance, MaintenanceConfig},
    security::ensure_not_root,
    ytdlp::{MediaTool, YtDlp},
};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the RedStream download API.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", help = "TOML config file (default /etc/redstream.toml if present)")]
    config: Option<PathBuf>,
    #[arg(long, help = "Address to listen on")]
    host: Option<String>,
    #[arg(long, help = "Port to listen on")]
    port: Option<u16>,
    #[arg(long, value_enum, help = "Wait for downloads (sync) or return at once (async)")]
    mode: Option<ExecutionMode>,
    #[arg(long = "download-root", value_name = "DIR", help = "Directory holding session folders")]
    download_root: Option<PathBuf>,
    #[arg(long = "allow-root", help = "Run even when started as root")]
    allow_root: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging("info");
    ensure_not_root("server", args.allow_root)?;

    let mut config = load_service_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(mode) = args.mode {
        config.execution_mode = mode;
    }
    if let Some(root) = args.download_root {
        config.download_root = root;
    }
    config.validate()?;

    std::fs::create_dir_all(&config.download_root).with_context(|| {
        format!("creating download root {}", config.download_root.display())
    })?;
    let index = SessionIndex::open(&config.index_path())?;
    let sessions = Arc::new(
        SessionManager::new(&config.download_root, config.file_expiry()).with_index(Arc::new(index)),
    );
    let tool: Arc<dyn MediaTool> = Arc::new(YtDlp::new(config.tool.clone()));

    let maintenance = Maintenance::start(
        Arc::clone(&sessions),
        Arc::clone(&tool),
        MaintenanceConfig {
            sweep_interval: config.sweep_interval(),
            update_interval: config.update_interval(),
        },
    );

    let orchestrator = Arc::new(DownloadOrchestrator::new(
        sessions,
        tool,
        config.execution_mode,
    ));
    let app = router(AppState::new(orchestrator));

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        root = %config.download_root.display(),
        mode = %config.execution_mode,
        expiry_minutes = config.file_expiry_minutes,
        "API server listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server");

    maintenance.shutdown().await;
    info!("server stopped");
    served
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}
