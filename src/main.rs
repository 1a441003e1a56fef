#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agenthub
//!
//! Control-plane hub for remote desktop sessions running behind platform
//! agents (Kubernetes, Docker, Hyper-V, vCenter).
//!
//! Each agent holds one persistent WebSocket to the hub. The hub dispatches
//! commands over it, tracks their lifecycle, and multiplexes per-session
//! framebuffer tunnels between browsers and the agent.
//!
//! ## Subcommands
//!
//! - `agenthub serve` (default): run the HTTP/WS server
//!
//! See [`agenthub::routes`] for the API surface.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, sweeps, graceful shutdown
//! config.rs        TOML + env-var configuration
//! auth.rs          principal resolution, constant-time comparison
//! protocol.rs      agent envelope codec
//! hub/
//!   mod.rs         AgentHub registry, AgentConnection, registration guard
//!   pumps.rs       read/write pumps
//! commands.rs      CommandTracker
//! tunnel/mod.rs    TunnelRouter (session demultiplexer)
//! control.rs       inbound control dispatch
//! store.rs         collaborator traits, MemoryStore
//! routes/          HTTP/WS handlers
//! ```

use std::sync::Arc;

use agenthub::config::Config;
use agenthub::protocol::{HubMessage, ShutdownPayload};
use agenthub::store::{MemoryStore, Stores};
use agenthub::AppState;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agenthub", version, about = "Agent connection hub and session tunnels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default)
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    };
    if let Err(e) = result {
        eprintln!("agenthub: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter))
        .init();

    info!("agenthub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.agent_key.is_none() {
        warn!("No agent_key configured, any inventoried agent id may connect");
    }
    if config.auth.tokens.is_empty() {
        warn!("No browser tokens configured, authenticated endpoints will reject all requests");
    }

    let store = Arc::new(MemoryStore::from_inventory(&config.inventory));
    info!(
        agents = config.inventory.agents.len(),
        sessions = config.inventory.sessions.len(),
        "Inventory loaded"
    );

    let state = AppState::new(config, Stores::memory(&store));
    let app = agenthub::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    // Periodic sweep: evict silent agents, expire unanswered commands
    let hub = state.hub.clone();
    let tracker = state.tracker.clone();
    let heartbeat_timeout = state.config.hub.heartbeat_timeout();
    let sweep_interval = state.config.hub.sweep_interval();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let evicted = hub.sweep_stale(heartbeat_timeout).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Swept stale agents");
            }
            let expired = tracker.sweep_expired().await;
            if !expired.is_empty() {
                info!(count = expired.len(), "Expired unanswered commands");
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGTERM handler");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "Server error");
    }

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();

    info!("Notifying agents of hub shutdown...");
    let notified = state
        .hub
        .broadcast(&HubMessage::Shutdown(ShutdownPayload {
            reason: Some("hub shutting down".into()),
        }))
        .await;
    info!(notified, "Shutdown notice sent");
    state.hub.drain_all().await;

    info!("Goodbye");
    Ok(())
}
