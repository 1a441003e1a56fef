//! Agent endpoints.
//!
//! - `GET /agents/connect?agent_id=<id>[&token=<agent_key>]`: agent WebSocket
//!   registration
//! - `GET /agents`: connected agents
//! - `DELETE /agents/{agent_id}`: force-disconnect an agent

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::auth::{constant_time_eq, Principal};
use crate::error::HubError;
use crate::hub::{Registered, RegistrationGuard};
use crate::store::{AgentRecord, Platform};
use crate::util::is_valid_agent_id;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Checks run before the upgrade: id present and well-formed, agent key
/// (when configured), agent known to the store.
pub async fn validate_agent_connect(
    state: &AppState,
    query: &ConnectQuery,
) -> Result<AgentRecord, HubError> {
    let agent_id = query
        .agent_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HubError::BadRequest("Missing agent_id".into()))?;
    if !is_valid_agent_id(agent_id) {
        return Err(HubError::BadRequest("Invalid agent_id format".into()));
    }
    if let Some(expected) = state.config.auth.agent_key.as_deref() {
        let provided = query.token.as_deref().unwrap_or("");
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(HubError::Forbidden("Invalid agent key".into()));
        }
    }
    state
        .stores
        .agents
        .find_agent(agent_id)
        .await?
        .ok_or_else(|| HubError::NotFound("Agent not found".into()))
}

/// `GET /agents/connect`: agent WebSocket registration.
pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let record = match validate_agent_connect(&state, &query).await {
        Ok(r) => r,
        Err(e) => {
            warn!(agent_id = ?query.agent_id, error = %e, "Agent connection rejected");
            return e.into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let guard = match state.hub.begin_registration(&record.agent_id) {
        Ok(g) => g,
        Err(e) => {
            warn!(agent_id = %record.agent_id, "Agent already registering");
            return e.into_response();
        }
    };

    let agent_id = record.agent_id.clone();
    info!(agent_id = %agent_id, platform = record.platform.as_str(), "Agent connecting...");
    ws.max_message_size(state.config.hub.max_message_bytes)
        .on_upgrade(move |socket| {
            handle_agent_socket(socket, state, guard, record.platform)
                .instrument(info_span!("agent", agent_id = %agent_id))
        })
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: AppState,
    guard: RegistrationGuard,
    platform: Platform,
) {
    let (sink, stream) = socket.split();
    let Registered {
        connection,
        inbound,
    } = state
        .hub
        .register(guard, platform, sink, stream, state.control.clone())
        .await;

    let demux = state.tunnels.spawn_agent_loop(
        connection.agent_id.clone(),
        connection.generation,
        inbound,
    );
    connection.stopped().await;
    if let Err(e) = demux.await {
        warn!(agent_id = %connection.agent_id, error = %e, "Tunnel loop panicked");
    }
}

/// `GET /agents`: connected agents with queue and heartbeat stats.
pub async fn list_agents(_principal: Principal, State(state): State<AppState>) -> Json<Value> {
    let agents = state.hub.snapshot().await;
    Json(json!({
        "agents": agents,
        "count": agents.len(),
    }))
}

/// `DELETE /agents/{agent_id}`: administrative disconnect.
pub async fn disconnect_agent(
    _principal: Principal,
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, HubError> {
    if !state.hub.unregister(&agent_id).await {
        return Err(HubError::NotFound(format!("Agent {agent_id} is not connected")));
    }
    info!(agent_id = %agent_id, "Agent disconnected by administrator");
    Ok(Json(json!({"agent_id": agent_id, "disconnected": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, Stores};
    use axum::http::StatusCode;
    use std::sync::Arc;

    async fn state(agent_key: Option<&str>) -> AppState {
        let store = Arc::new(MemoryStore::new());
        store.put_agent("a1", Platform::Docker).await;
        let mut config = Config::default();
        config.auth.agent_key = agent_key.map(str::to_string);
        AppState::new(config, Stores::memory(&store))
    }

    fn query(agent_id: Option<&str>, token: Option<&str>) -> ConnectQuery {
        ConnectQuery {
            agent_id: agent_id.map(str::to_string),
            token: token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_connect_validation() {
        let s = state(None).await;
        let err = validate_agent_connect(&s, &query(None, None)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Missing agent_id");

        let err = validate_agent_connect(&s, &query(Some("a b"), None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = validate_agent_connect(&s, &query(Some("ghost"), None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let record = validate_agent_connect(&s, &query(Some("a1"), None))
            .await
            .unwrap();
        assert_eq!(record.platform, Platform::Docker);
    }

    #[tokio::test]
    async fn test_connect_agent_key() {
        let s = state(Some("k")).await;
        let err = validate_agent_connect(&s, &query(Some("a1"), Some("wrong")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(validate_agent_connect(&s, &query(Some("a1"), Some("k")))
            .await
            .is_ok());
    }
}
