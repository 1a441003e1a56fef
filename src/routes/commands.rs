//! Command endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::auth::Principal;
use crate::commands::{Command, CommandRequest};
use crate::error::HubError;
use crate::AppState;

/// `POST /agents/{agent_id}/commands`: dispatch a command to a connected agent.
///
/// Body: `{"action": "...", "sessionId": "...", "args": {...}}`. Returns
/// `202 Accepted` with the pending command; `503` if the agent is offline.
pub async fn dispatch(
    principal: Principal,
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<(StatusCode, Json<Command>), HubError> {
    tracing::debug!(user = %principal.user_id, agent_id = %agent_id, action = %request.action, "Command requested");
    let command = state.tracker.dispatch(&agent_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(command)))
}

/// `GET /commands/{command_id}`: persisted command record.
pub async fn get_command(
    _principal: Principal,
    State(state): State<AppState>,
    Path(command_id): Path<String>,
) -> Result<Json<Command>, HubError> {
    state
        .tracker
        .find(&command_id)
        .await?
        .map(Json)
        .ok_or_else(|| HubError::NotFound("Command not found".into()))
}
