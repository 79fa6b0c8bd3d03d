//! cortex-gateway — HTTP host for the chat pipeline and the digest worker.
//!
//! Subcommands:
//!   (default)      serve the chat API; spawns the inline digest worker
//!                  when `digest.run_mode = inline`.
//!   digest-worker  standalone sidecar loop (runs the digest pipeline at
//!                  04:00 local and exits only on shutdown). Deploy with
//!                  restart policy on-failure so crash loops stay visible.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use cortex_core::config::CortexConfig;
use cortex_digest::weekly::GraphMirror;
use cortex_digest::DigestWorker;

mod app;
mod http;

use app::AppState;

#[derive(Parser)]
#[command(name = "cortex-gateway", about = "Cortex agent runtime host")]
struct Cli {
    /// Path to cortex.toml (default: ./cortex.toml)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat API (default).
    Serve,
    /// Run the digest pipeline sidecar loop.
    DigestWorker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = CortexConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::DigestWorker => run_sidecar(config).await,
    }
}

async fn serve(config: CortexConfig) -> anyhow::Result<()> {
    let state = AppState::build(config.clone());

    // Tool discovery is best-effort at startup; the hub re-initialises on
    // demand and tools missing now are simply not dispatched.
    if let Err(e) = state.hub.initialize().await {
        error!(error = %e, "mcp hub initialisation failed — continuing without tools");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Inline digest worker (one per process, guarded).
    if cortex_digest::worker::spawn_inline_worker(
        config.digest.clone(),
        config.typedstate.csv_path.clone(),
        shutdown_rx.clone(),
    ) {
        info!("inline digest worker spawned");
    }

    let router = Router::new()
        .route("/v1/chat", post(http::chat::chat_handler))
        .route("/v1/runtime/digest", get(http::runtime::digest_status_handler))
        .route("/v1/packages", get(http::runtime::packages_handler))
        .route(
            "/v1/packages/installed",
            get(http::runtime::packages_installed_handler),
        )
        .route("/health", get(http::runtime::health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn run_sidecar(config: CortexConfig) -> anyhow::Result<()> {
    let hub = Arc::new(cortex_mcp::McpHub::new(
        config.mcp.base_url.clone(),
        config.mcp.tool_timeout_s,
    ));
    if let Err(e) = hub.initialize().await {
        // The archive graph mirror is best-effort; the store stays truth.
        error!(error = %e, "mcp hub unavailable — archive mirror disabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let worker = DigestWorker::new(config.digest.clone(), config.typedstate.csv_path.clone());
    info!(owner = %worker.owner(), "digest sidecar starting");
    worker
        .run_loop(Some(hub.as_ref() as &dyn GraphMirror), shutdown_rx)
        .await;
    Ok(())
}
