mod config;
mod error;
mod fetcher;
mod health;
mod http;
mod merger;
mod metrics;
mod model;
mod ostree;
mod pipeline;
mod store;
mod upload;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::fetcher::ArtifactFetcher;
use crate::metrics::MetricsRegistry;
use crate::ostree::{OstreeCli, RepoTool};
use crate::pipeline::{BuildPipeline, Dispatcher};
use crate::store::{KeyDbStore, MemoryStore, UpdateStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "edge-updates", about = "OSTree update repository builder")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/edge-updates/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn UpdateStore>,
    pub dispatcher: Dispatcher,
    pub metrics: MetricsRegistry,
    pub ostree: OstreeCli,
}

// ---------------------------------------------------------------------------
// Store selection
// ---------------------------------------------------------------------------

async fn build_store(config: &Config) -> Result<Arc<dyn UpdateStore>> {
    match &config.keydb {
        Some(keydb) => {
            let store = KeyDbStore::connect(keydb)
                .await
                .context("failed to initialise KeyDB update store")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("no keydb configured; update records are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &Config) -> Result<aws_sdk_s3::Client> {
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(config.storage.s3.region.clone()));

    if config.storage.s3.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }

    let aws_config = aws_config_loader.load().await;
    let client = aws_sdk_s3::Client::new(&aws_config);
    tracing::info!(
        bucket = %config.storage.s3.bucket,
        region = %config.storage.s3.region,
        fips = config.storage.s3.use_fips,
        "S3 client initialised"
    );
    Ok(client)
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting edge-updates");

    // ---- Ensure the work root exists ----
    tokio::fs::create_dir_all(&config.build.work_root)
        .await
        .with_context(|| {
            format!(
                "failed to create work root: {}",
                config.build.work_root.display()
            )
        })?;

    // ---- Infrastructure clients ----
    let store = build_store(&config).await?;

    let s3 = match upload::UploaderKind::select(&config.storage) {
        upload::UploaderKind::ObjectStorage => Some(build_s3_client(&config).await?),
        upload::UploaderKind::Local => None,
    };
    let uploader = upload::build_uploader(&config.storage, s3)?;
    tracing::info!(kind = ?uploader.kind(), "uploader selected");

    let http_client = reqwest::Client::builder()
        .user_agent(config.build.user_agent.as_str())
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Build pipeline ----
    let ostree = OstreeCli::new(&config.build.ostree_bin);
    let tool: Arc<dyn RepoTool> = Arc::new(ostree.clone());
    let fetcher = ArtifactFetcher::new(http_client, Arc::clone(&tool));
    let pipeline = Arc::new(BuildPipeline::new(
        tool,
        fetcher,
        uploader,
        Arc::clone(&store),
        config.build.work_root.clone(),
    ));

    let (dispatcher, reports) = Dispatcher::new(pipeline, metrics.clone());
    let supervisor_handle = tokio::spawn(pipeline::run_supervisor(reports, metrics.clone()));

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        store,
        dispatcher,
        metrics,
        ostree,
    };

    // ---- Serve until shutdown ----
    if let Err(e) = run_http_server(state).await {
        tracing::error!(error = %e, "HTTP server failed");
    }

    // Running builds hold report senders; the supervisor exits once the last
    // of them has reported.
    let _ = supervisor_handle.await;

    tracing::info!("edge-updates shut down cleanly");
    Ok(())
}
