#![forbid(unsafe_code)]

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ytdlp_gateway::{
    api::{self, AppState, ROUTES},
    config::{ConfigOverrides, load_config},
    retention::spawn_sweeper,
    security::ensure_not_root,
    ytdlp::YtDlpProcess,
};

#[derive(Debug, Parser)]
#[command(name = "ytdlp-gateway", version, about = "HTTP gateway for yt-dlp downloads")]
struct ServerArgs {
    /// Dotenv file read before the process environment
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Overrides PORT
    #[arg(long)]
    port: Option<u16>,

    /// Overrides HOST
    #[arg(long)]
    host: Option<String>,

    /// Overrides YTDLP_OUTPUT_PATH
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Skip the startup check that refuses to run as root
    #[arg(long)]
    allow_root: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_tracing();

    if !args.allow_root {
        ensure_not_root("ytdlp-gateway")?;
    }

    let config = load_config(ConfigOverrides {
        port: args.port,
        host: args.host,
        output_dir: args.output_dir,
        env_path: args.env_file,
    })?;

    let output_dir = &config.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    info!(
        env = config.app_env.as_deref().unwrap_or("unset"),
        output_dir = %config.output_dir.display(),
        cors_origin = %config.cors_origin,
        max_concurrent = ?config.max_concurrent_downloads,
        max_age_minutes = config.retention.max_age_minutes,
        "configuration loaded"
    );
    if config.cookies_from_browser.is_some() {
        info!("yt-dlp will read cookies from the configured browser");
    }

    let host = config.host.clone();
    let port = config.port;
    let base_url = config.public_base_url();
    let retention_interval = config.retention.periodic_interval();

    let config = Arc::new(config);
    let tool = Arc::new(YtDlpProcess::new(config.ytdlp_bin.clone()));
    info!(program = %tool.program().display(), "using downloader");
    let state = AppState::new(config, tool);
    info!(dir = %state.sweeper.dir().display(), "starting retention sweeper");
    let sweeper = spawn_sweeper(state.sweeper.clone(), retention_interval);

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding to {host}:{port}"))?;
    info!(addr = %format!("{host}:{port}"), public = %base_url, "server listening");
    for route in ROUTES {
        info!("  {route}");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper.abort();
    info!("server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates the
    // process if the handler cannot be installed.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
