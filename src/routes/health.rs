//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Returns status, uptime, version and hub counters. No authentication
/// required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let agents = state.hub.connected_count().await;
    let tunnels = state.tunnels.open_count().await;
    let inflight = state.tracker.inflight_count().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "agents_connected": agents,
        "tunnels_open": tunnels,
        "tunnel_frames_dropped": state.tunnels.dropped_frames(),
        "commands_inflight": inflight,
    }))
}
