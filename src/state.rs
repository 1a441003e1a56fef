//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::commands::CommandTracker;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::hub::{AgentHub, HubOptions};
use crate::store::Stores;
use crate::tunnel::TunnelRouter;

/// Shared application state for the hub server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Registry of connected agents.
    pub hub: AgentHub,
    /// Command dispatch and reply correlation.
    pub tracker: CommandTracker,
    /// Session id → browser tunnel routes.
    pub tunnels: TunnelRouter,
    /// Inbound control dispatch handed to every agent read pump.
    pub control: Arc<ControlPlane>,
    /// Collaborator stores.
    pub stores: Stores,
    /// Broadcast channel for hub events (agent, command and tunnel lifecycle).
    pub events: broadcast::Sender<Value>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
}

impl AppState {
    /// Wire every component from `config` over the given stores.
    pub fn new(config: Config, stores: Stores) -> Self {
        let (events, _) = broadcast::channel(256);
        let hub = AgentHub::new(
            HubOptions::from(&config.hub),
            stores.agents.clone(),
            events.clone(),
        );
        let tracker = CommandTracker::new(
            hub.clone(),
            stores.commands.clone(),
            config.hub.command_timeout(),
            events.clone(),
        );
        let tunnels = TunnelRouter::new(
            hub.clone(),
            stores.sessions.clone(),
            config.tunnel.browser_queue,
            events.clone(),
        );
        let control = Arc::new(ControlPlane::new(
            hub.clone(),
            stores.agents.clone(),
            stores.sessions.clone(),
            tracker.clone(),
            tunnels.clone(),
        ));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            hub,
            tracker,
            tunnels,
            control,
            stores,
            events,
            sse_connections: Arc::new(AtomicU32::new(0)),
        }
    }
}
