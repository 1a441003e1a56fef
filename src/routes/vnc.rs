//! Browser tunnel endpoint.
//!
//! `GET /vnc/{session_id}` upgrades to a WebSocket carrying raw framebuffer
//! bytes for one session. Requests are validated before the upgrade:
//!
//! | Check                          | Status |
//! |--------------------------------|--------|
//! | session id present             | 400    |
//! | principal resolved             | 401    |
//! | session exists                 | 404    |
//! | principal owns the session     | 403    |
//! | session is `running`           | 409    |
//! | session has an agent           | 503    |
//! | that agent is connected        | 503    |
//!
//! After the upgrade the browser is attached to the session route (replacing
//! any earlier browser) and bytes are relayed until either side closes.

use axum::{
    extract::{
        ws::{
            rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{MaybePrincipal, Principal};
use crate::error::HubError;
use crate::tunnel::CloseReason;
use crate::AppState;

/// Run the pre-upgrade checks. Returns the id of the agent serving the session.
pub async fn validate_tunnel_request(
    state: &AppState,
    session_id: &str,
    principal: Option<&Principal>,
) -> Result<String, HubError> {
    if session_id.trim().is_empty() {
        return Err(HubError::BadRequest("sessionId is required".into()));
    }
    let principal = principal.ok_or(HubError::Unauthorized)?;

    let session = state
        .stores
        .sessions
        .find_session(session_id)
        .await?
        .ok_or_else(|| HubError::NotFound("Session not found".into()))?;
    if session.owner != principal.user_id {
        return Err(HubError::Forbidden("Access denied".into()));
    }
    if !session.is_running() {
        return Err(HubError::Conflict(format!(
            "Session is not running (state: {})",
            session.state
        )));
    }
    let agent_id = session
        .agent_id
        .ok_or_else(|| HubError::Unavailable("Session has no agent assigned".into()))?;
    if !state.hub.is_connected(&agent_id).await {
        return Err(HubError::AgentNotConnected(agent_id));
    }
    Ok(agent_id)
}

/// `GET /vnc/{session_id}`: browser tunnel upgrade.
pub async fn vnc_tunnel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    MaybePrincipal(principal): MaybePrincipal,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let agent_id = match validate_tunnel_request(&state, &session_id, principal.as_ref()).await {
        Ok(a) => a,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "Tunnel request rejected");
            return e.into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let user = principal.map(|p| p.user_id).unwrap_or_default();
    let span = info_span!("vnc_tunnel", session_id = %session_id, user = %user);
    ws.max_message_size(state.config.hub.max_message_bytes)
        .on_upgrade(move |socket| relay_browser(socket, state, session_id, agent_id).instrument(span))
}

async fn relay_browser(mut socket: WebSocket, state: AppState, session_id: String, agent_id: String) {
    let mut route = match state.tunnels.open_route(&session_id, &agent_id).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to open tunnel route");
            let reason = CloseReason::AgentDisconnected;
            let _ = socket.send(close_message(reason)).await;
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            biased;
            _ = route.closed.changed() => {
                break (*route.closed.borrow()).unwrap_or(CloseReason::AgentDisconnected);
            }
            frame = route.frames.recv() => {
                let Some(bytes) = frame else {
                    break (*route.closed.borrow()).unwrap_or(CloseReason::AgentDisconnected);
                };
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break CloseReason::ClientDisconnect;
                }
            }
            msg = stream.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec().into(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => {
                        break CloseReason::ClientDisconnect;
                    }
                };
                match state.tunnels.route_to_agent(&session_id, &data).await {
                    Ok(()) => {}
                    Err(HubError::QueueFull(_)) => {
                        warn!("Agent queue full, dropping browser frame");
                    }
                    Err(HubError::NoRoute(_)) => {
                        break (*route.closed.borrow()).unwrap_or(CloseReason::ClientDisconnect);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to forward browser frame");
                        break CloseReason::AgentDisconnected;
                    }
                }
            }
        }
    };

    state
        .tunnels
        .close_route_if(&session_id, route.route_id, reason)
        .await;
    if reason != CloseReason::ClientDisconnect {
        let _ = sink.send(close_message(reason)).await;
    }
    info!(reason = reason.as_str(), "Browser tunnel ended");
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.as_str().into(),
    }))
}
