//! HTTP route handlers.
//!
//! | Method | Path                          | Auth        | Description                     |
//! |--------|-------------------------------|-------------|---------------------------------|
//! | GET    | `/health`                     | No          | Liveness probe                  |
//! | GET    | `/agents/connect`             | `agent_key` | Agent WebSocket registration    |
//! | GET    | `/agents`                     | Yes         | Connected agents                |
//! | DELETE | `/agents/{agent_id}`          | Yes         | Force-disconnect an agent       |
//! | POST   | `/agents/{agent_id}/commands` | Yes         | Dispatch a command              |
//! | GET    | `/commands/{command_id}`      | Yes         | Command status                  |
//! | GET    | `/vnc/{session_id}`           | Yes*        | Browser tunnel WebSocket        |
//! | GET    | `/events`                     | Yes         | SSE hub events                  |
//!
//! *Browsers pass `?token=<token>` on the upgrade.

pub mod agents;
pub mod commands;
pub mod events;
pub mod health;
pub mod vnc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{attach_principal, TokenTable};
use crate::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let tokens = TokenTable::new(state.config.auth.tokens.clone());

    Router::new()
        .route("/health", get(health::health))
        .route("/agents/connect", get(agents::connect))
        .route("/agents", get(agents::list_agents))
        .route("/agents/{agent_id}", delete(agents::disconnect_agent))
        .route("/agents/{agent_id}/commands", post(commands::dispatch))
        .route("/commands/{command_id}", get(commands::get_command))
        .route("/vnc/{session_id}", get(vnc::vnc_tunnel))
        .route("/events", get(events::event_stream))
        .layer(middleware::from_fn(attach_principal))
        .layer(Extension(tokens))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, Platform, Stores};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        store.put_agent("a1", Platform::Kubernetes).await;
        let mut config = Config::default();
        config
            .auth
            .tokens
            .insert("tok-alice".into(), "alice".into());
        router(AppState::new(config, Stores::memory(&store)))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        req.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (status, body) = send(app().await, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents_connected"], 0);
    }

    #[tokio::test]
    async fn test_agents_requires_principal() {
        let (status, body) = send(app().await, get("/agents", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, body) = send(app().await, get("/agents", Some("tok-alice"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_connect_missing_agent_id() {
        let (status, body) = send(app().await, get("/agents/connect", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing agent_id");
    }

    #[tokio::test]
    async fn test_connect_unknown_agent() {
        let (status, body) = send(app().await, get("/agents/connect?agent_id=ghost", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Agent not found");
    }

    #[tokio::test]
    async fn test_dispatch_to_offline_agent() {
        let req = Request::builder()
            .method("POST")
            .uri("/agents/a1/commands")
            .header("authorization", "Bearer tok-alice")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"action":"start_session","sessionId":"s1"}"#))
            .unwrap();
        let (status, body) = send(app().await, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Agent a1 is not connected");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (status, _) = send(app().await, get("/commands/nope", Some("tok-alice"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_vnc_unauthorized() {
        let (status, _) = send(app().await, get("/vnc/s1", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
