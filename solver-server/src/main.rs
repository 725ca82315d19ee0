//! Solver server - accepts chains over HTTP and solves them in the background.

mod dispatch;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use solver::io::config::{Credentials, DEFAULT_CONFIG_PATH, load_config};
use solver::io::prompt::PromptBuilder;
use solver::io::run_store::{InMemoryRunStore, RunStore};
use solver::logging;
use solver::looping::{LoopConfig, TaskLoop};
use solver::solve::{Collaborators, Solver};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "solver-server")]
#[command(about = "HTTP front end for the quiz chain solver")]
struct Args {
    /// Path to the TOML config (missing file means defaults)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address to bind the server to (overrides `server.bind`)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides `server.port`)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("solver=info,solver_server=info");

    let args = Args::parse();
    let config = load_config(&args.config)?;
    let secret = std::env::var("USER_SECRET")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .context("USER_SECRET must be set")?;

    let collaborators = Collaborators::from_config(&config, &Credentials::from_env())?;
    let solver = Solver::new(
        collaborators,
        PromptBuilder::new(config.reasoner.prompt_budget_bytes),
    );
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::with_retention(
        config.server.max_retained_runs,
    ));
    let task_loop = TaskLoop::new(LoopConfig::from_config(&config)?, solver, store);
    let state = AppState::new(task_loop, secret);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let bind = args.bind.unwrap_or(config.server.bind);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
