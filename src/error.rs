//! Error taxonomy shared by the hub, the command tracker, the tunnel router
//! and the HTTP handlers.
//!
//! Every variant maps to one HTTP status and a stable machine-readable `code`
//! (see [`HubError::code`]). Handlers return `Result<_, HubError>` and let the
//! [`IntoResponse`] impl render `{"error": ..., "code": ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the hub core and its HTTP boundary.
#[derive(Debug, Error)]
pub enum HubError {
    /// Missing or malformed request field.
    #[error("{0}")]
    BadRequest(String),

    /// No authenticated principal attached to the request.
    #[error("Unauthorized")]
    Unauthorized,

    /// Principal is authenticated but not allowed to touch the resource.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown agent, session or command.
    #[error("{0}")]
    NotFound(String),

    /// Resource is not in a state that allows the operation.
    #[error("{0}")]
    Conflict(String),

    /// A transport upgrade for this agent id is still in flight.
    #[error("Agent {0} is already registering")]
    AlreadyRegistering(String),

    /// No live connection in the registry for this agent id.
    #[error("Agent {0} is not connected")]
    AgentNotConnected(String),

    /// The agent's outbound queue is saturated; the frame was not enqueued.
    #[error("Agent {0} send queue is full")]
    QueueFull(String),

    /// No open tunnel route for this session.
    #[error("No tunnel route for session {0}")]
    NoRoute(String),

    /// The resource exists but cannot be served right now.
    #[error("{0}")]
    Unavailable(String),

    /// Read or write failure on an active connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// External store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Envelope serialization failure.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HubError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::NoRoute(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AlreadyRegistering(_) => StatusCode::CONFLICT,
            Self::AgentNotConnected(_) | Self::QueueFull(_) | Self::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code included in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::AlreadyRegistering(_) => "ALREADY_REGISTERING",
            Self::AgentNotConnected(_) => "AGENT_NOT_CONNECTED",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::NoRoute(_) => "NO_ROUTE",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Encode(_) => "ENCODE_ERROR",
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            HubError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(HubError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            HubError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HubError::AgentNotConnected("a1".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            HubError::QueueFull("a1".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            HubError::Transport("eof".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            HubError::AgentNotConnected("a1".into()).to_string(),
            "Agent a1 is not connected"
        );
        assert_eq!(
            HubError::NoRoute("s1".into()).to_string(),
            "No tunnel route for session s1"
        );
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let resp = HubError::Conflict("Session is not running (state: hibernated)".into())
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Session is not running (state: hibernated)");
        assert_eq!(body["code"], "CONFLICT");
    }
}
