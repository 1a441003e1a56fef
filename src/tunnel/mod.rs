//! Session tunnel demultiplexer.
//!
//! Maps `sessionId` to the single browser connection currently attached to
//! that session, and moves framebuffer bytes both ways:
//!
//! - **Browser → agent**: [`TunnelRouter::route_to_agent`] wraps bytes in a
//!   `vnc_data` envelope and enqueues it on the owning agent's connection.
//! - **Agent → browser**: one loop per agent connection
//!   ([`TunnelRouter::spawn_agent_loop`]) drains the agent's inbound tunnel
//!   queue and hands each frame to the route for its session.
//!
//! A route is owned by the browser relay task holding its [`RouteHandle`].
//! Closing a route (from any side) publishes a [`CloseReason`] on the
//! handle's watch channel; the relay task turns that into a close frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::error::HubError;
use crate::hub::AgentHub;
use crate::protocol::{HubMessage, TunnelFrame, VncClosePayload, VncDataPayload};
use crate::store::SessionStore;

/// Why a route was closed. Sent to the browser as the close frame reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AgentDisconnected,
    SessionTerminated,
    ReplacedByNewConnection,
    TunnelError,
    ClientDisconnect,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentDisconnected => "agent_disconnected",
            Self::SessionTerminated => "session_terminated",
            Self::ReplacedByNewConnection => "replaced_by_new_connection",
            Self::TunnelError => "tunnel_error",
            Self::ClientDisconnect => "client_disconnect",
        }
    }

    /// WebSocket close code.
    pub fn code(self) -> u16 {
        match self {
            Self::AgentDisconnected => 1001,
            Self::SessionTerminated | Self::ClientDisconnect => 1000,
            Self::ReplacedByNewConnection => 4000,
            Self::TunnelError => 1011,
        }
    }

    /// Whether the agent should be told to tear down its side.
    fn notifies_agent(self) -> bool {
        !matches!(self, Self::AgentDisconnected | Self::ReplacedByNewConnection)
    }
}

struct Route {
    agent_id: String,
    agent_generation: u64,
    route_id: u64,
    frames: mpsc::Sender<Bytes>,
    closed: watch::Sender<Option<CloseReason>>,
    opened_at: Instant,
}

/// The browser side of an open route.
pub struct RouteHandle {
    pub session_id: String,
    pub agent_id: String,
    pub route_id: u64,
    /// Bytes from the agent, in arrival order.
    pub frames: mpsc::Receiver<Bytes>,
    /// Becomes `Some` once the route is closed.
    pub closed: watch::Receiver<Option<CloseReason>>,
}

struct RouterInner {
    routes: RwLock<HashMap<String, Route>>,
    next_route_id: AtomicU64,
    dropped_frames: AtomicU64,
    browser_queue: usize,
    hub: AgentHub,
    sessions: Arc<dyn SessionStore>,
    events: broadcast::Sender<Value>,
}

/// Route table keyed by session id. Cheap to clone.
#[derive(Clone)]
pub struct TunnelRouter {
    inner: Arc<RouterInner>,
}

impl TunnelRouter {
    pub fn new(
        hub: AgentHub,
        sessions: Arc<dyn SessionStore>,
        browser_queue: usize,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                routes: RwLock::new(HashMap::new()),
                next_route_id: AtomicU64::new(1),
                dropped_frames: AtomicU64::new(0),
                browser_queue: browser_queue.max(1),
                hub,
                sessions,
                events,
            }),
        }
    }

    /// Attach a browser to `session_id`, replacing any existing route.
    ///
    /// The previous browser (if any) is closed with
    /// [`CloseReason::ReplacedByNewConnection`] before the new route is
    /// returned.
    pub async fn open_route(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<RouteHandle, HubError> {
        let conn = self
            .inner
            .hub
            .connection(agent_id)
            .await
            .filter(|c| !c.is_cancelled())
            .ok_or_else(|| HubError::AgentNotConnected(agent_id.to_string()))?;

        let (frames_tx, frames_rx) = mpsc::channel(self.inner.browser_queue);
        let (closed_tx, closed_rx) = watch::channel(None);
        let route_id = self.inner.next_route_id.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            agent_id: agent_id.to_string(),
            agent_generation: conn.generation,
            route_id,
            frames: frames_tx,
            closed: closed_tx,
            opened_at: Instant::now(),
        };

        let previous = self
            .inner
            .routes
            .write()
            .await
            .insert(session_id.to_string(), route);
        if let Some(old) = previous {
            info!(session_id = %session_id, "Replacing existing browser connection");
            self.finish_close(session_id, old, CloseReason::ReplacedByNewConnection)
                .await;
        }

        self.adjust_connections(session_id, 1).await;
        info!(
            session_id = %session_id,
            agent_id = %agent_id,
            route_id,
            "Tunnel route opened"
        );
        let _ = self.inner.events.send(json!({
            "type": "tunnel.opened",
            "session_id": session_id,
            "agent_id": agent_id,
        }));

        // The connection may have died after the check above but before the
        // route was visible to its demux loop; the handle then starts closed.
        if conn.is_cancelled() {
            self.close_route_if(session_id, route_id, CloseReason::AgentDisconnected)
                .await;
        }

        Ok(RouteHandle {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            route_id,
            frames: frames_rx,
            closed: closed_rx,
        })
    }

    /// Send browser bytes to the agent serving `session_id`.
    pub async fn route_to_agent(&self, session_id: &str, data: &[u8]) -> Result<(), HubError> {
        let agent_id = {
            let routes = self.inner.routes.read().await;
            let route = routes
                .get(session_id)
                .ok_or_else(|| HubError::NoRoute(session_id.to_string()))?;
            route.agent_id.clone()
        };
        let msg = HubMessage::VncData(VncDataPayload::from_bytes(session_id, data));
        self.inner.hub.send(&agent_id, &msg).await
    }

    /// Close the route for `session_id`. Returns `false` if none was open.
    pub async fn close_route(&self, session_id: &str, reason: CloseReason) -> bool {
        let removed = self.inner.routes.write().await.remove(session_id);
        match removed {
            Some(route) => {
                self.finish_close(session_id, route, reason).await;
                true
            }
            None => false,
        }
    }

    /// Close the route only if it is still the one identified by `route_id`.
    ///
    /// Used by a browser relay on exit so it never tears down its replacement.
    pub async fn close_route_if(
        &self,
        session_id: &str,
        route_id: u64,
        reason: CloseReason,
    ) -> bool {
        let removed = {
            let mut routes = self.inner.routes.write().await;
            match routes.get(session_id) {
                Some(r) if r.route_id == route_id => routes.remove(session_id),
                _ => None,
            }
        };
        match removed {
            Some(route) => {
                self.finish_close(session_id, route, reason).await;
                true
            }
            None => false,
        }
    }

    /// Close every route served by one generation of an agent connection.
    pub async fn close_routes_for_agent(
        &self,
        agent_id: &str,
        generation: u64,
        reason: CloseReason,
    ) -> usize {
        let removed: Vec<(String, Route)> = {
            let mut routes = self.inner.routes.write().await;
            let ids: Vec<String> = routes
                .iter()
                .filter(|(_, r)| r.agent_id == agent_id && r.agent_generation == generation)
                .map(|(sid, _)| sid.clone())
                .collect();
            ids.into_iter()
                .filter_map(|sid| routes.remove(&sid).map(|r| (sid, r)))
                .collect()
        };
        let count = removed.len();
        for (session_id, route) in removed {
            self.finish_close(&session_id, route, reason).await;
        }
        count
    }

    async fn finish_close(&self, session_id: &str, route: Route, reason: CloseReason) {
        if reason.notifies_agent() {
            let msg = HubMessage::VncClose(VncClosePayload {
                session_id: session_id.to_string(),
                reason: Some(reason.as_str().to_string()),
            });
            if let Err(e) = self.inner.hub.send(&route.agent_id, &msg).await {
                debug!(session_id = %session_id, error = %e, "Close notice not delivered to agent");
            }
        }
        route.closed.send_replace(Some(reason));
        self.adjust_connections(session_id, -1).await;
        info!(
            session_id = %session_id,
            agent_id = %route.agent_id,
            reason = reason.as_str(),
            open_secs = route.opened_at.elapsed().as_secs(),
            "Tunnel route closed"
        );
        let _ = self.inner.events.send(json!({
            "type": "tunnel.closed",
            "session_id": session_id,
            "agent_id": route.agent_id,
            "reason": reason.as_str(),
        }));
    }

    async fn adjust_connections(&self, session_id: &str, delta: i32) {
        if let Err(e) = self.inner.sessions.adjust_connections(session_id, delta).await {
            debug!(session_id = %session_id, error = %e, "Connection count not updated");
        }
    }

    /// Hand one inbound tunnel frame from `agent_id` to its route.
    pub async fn deliver(&self, agent_id: &str, frame: TunnelFrame) {
        match frame {
            TunnelFrame::Data(payload) => {
                let routes = self.inner.routes.read().await;
                let Some(route) = routes
                    .get(&payload.session_id)
                    .filter(|r| r.agent_id == agent_id)
                else {
                    self.count_dropped();
                    debug!(
                        agent_id = %agent_id,
                        session_id = %payload.session_id,
                        "No route for tunnel frame, dropping"
                    );
                    return;
                };
                let bytes = match payload.decode_data() {
                    Ok(b) => Bytes::from(b),
                    Err(e) => {
                        self.count_dropped();
                        warn!(session_id = %payload.session_id, error = %e, "Undecodable tunnel data");
                        return;
                    }
                };
                if let Err(mpsc::error::TrySendError::Full(_)) = route.frames.try_send(bytes) {
                    self.count_dropped();
                    warn!(session_id = %payload.session_id, "Browser queue full, dropping frame");
                }
            }
            TunnelFrame::Ready(payload) => {
                info!(
                    agent_id = %agent_id,
                    session_id = %payload.session_id,
                    vnc_port = payload.vnc_port,
                    "Session VNC ready"
                );
            }
            TunnelFrame::Error(payload) => {
                let owned = self.route_served_by(&payload.session_id, agent_id).await;
                warn!(
                    agent_id = %agent_id,
                    session_id = %payload.session_id,
                    error = %payload.error,
                    "Agent reported tunnel error"
                );
                if let Some(route_id) = owned {
                    self.close_route_if(&payload.session_id, route_id, CloseReason::TunnelError)
                        .await;
                }
            }
        }
    }

    /// Demultiplex one agent connection's inbound frames until its read pump
    /// ends, then close every route that connection served.
    pub fn spawn_agent_loop(
        &self,
        agent_id: String,
        generation: u64,
        mut inbound: mpsc::Receiver<TunnelFrame>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(
            async move {
                while let Some(frame) = inbound.recv().await {
                    router.deliver(&agent_id, frame).await;
                }
                let closed = router
                    .close_routes_for_agent(&agent_id, generation, CloseReason::AgentDisconnected)
                    .await;
                if closed > 0 {
                    info!(agent_id = %agent_id, closed, "Closed tunnels of disconnected agent");
                }
            }
            .in_current_span(),
        )
    }

    pub async fn open_count(&self) -> usize {
        self.inner.routes.read().await.len()
    }

    /// Id of the route for `session_id` if `agent_id` serves it.
    pub async fn route_served_by(&self, session_id: &str, agent_id: &str) -> Option<u64> {
        self.inner
            .routes
            .read()
            .await
            .get(session_id)
            .filter(|r| r.agent_id == agent_id)
            .map(|r| r.route_id)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }

    fn count_dropped(&self) {
        self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{connect_mock, test_hub, MockAgent, RecordingHandler};
    use crate::hub::Registered;
    use crate::protocol::ShutdownPayload;
    use crate::store::{MemoryStore, Platform};
    use axum::extract::ws::Message;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;
    use std::time::Duration;

    async fn setup() -> (AgentHub, Arc<MemoryStore>, TunnelRouter, MockAgent) {
        let (hub, store) = test_hub().await;
        store.put_session("s1", "alice", "running", "a1").await;
        let (events, _) = broadcast::channel(64);
        let router = TunnelRouter::new(hub.clone(), store.clone(), 16, events);
        let (Registered { connection, inbound }, agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        router.spawn_agent_loop("a1".into(), connection.generation, inbound);
        (hub, store, router, agent)
    }

    async fn wait_closed(handle: &mut RouteHandle) -> CloseReason {
        tokio::time::timeout(Duration::from_secs(5), handle.closed.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::AgentDisconnected.as_str(), "agent_disconnected");
        assert_eq!(CloseReason::ReplacedByNewConnection.code(), 4000);
        assert_eq!(CloseReason::TunnelError.code(), 1011);
        assert!(CloseReason::ClientDisconnect.notifies_agent());
        assert!(!CloseReason::AgentDisconnected.notifies_agent());
    }

    #[tokio::test]
    async fn test_round_trip_through_mock_agent() {
        let (_hub, _store, router, mut agent) = setup().await;
        let mut handle = router.open_route("s1", "a1").await.unwrap();

        let payload: Vec<u8> = (0..=255).collect();
        router.route_to_agent("s1", &payload).await.unwrap();

        // Echo exactly what the hub sent.
        let text = agent.next_text().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "vnc_data");
        assert_eq!(value["payload"]["sessionId"], "s1");
        agent.send_text(&text).await;

        let echoed = handle.frames.recv().await.unwrap();
        assert_eq!(echoed.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_route_to_closed_session() {
        let (_hub, _store, router, _agent) = setup().await;
        assert!(matches!(
            router.route_to_agent("s1", b"x").await,
            Err(HubError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_no_route_on_dying_connection() {
        let (hub, store) = test_hub().await;
        store.put_session("s1", "alice", "running", "a1").await;
        let (events, _) = broadcast::channel(64);
        let router = TunnelRouter::new(hub.clone(), store.clone(), 16, events);

        // A transport nobody reads keeps the write pump stuck in a flush, so
        // the entry outlives its read side.
        let (out_tx, _out_rx) = fmpsc::channel::<Message>(0);
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, Infallible>>();
        let guard = hub.begin_registration("a1").unwrap();
        let Registered { connection, inbound } = hub
            .register(
                guard,
                Platform::Kubernetes,
                out_tx,
                in_rx,
                Arc::new(RecordingHandler::default()),
            )
            .await;
        let demux = router.spawn_agent_loop("a1".into(), connection.generation, inbound);

        let msg = HubMessage::Shutdown(ShutdownPayload::default());
        hub.send("a1", &msg).await.unwrap();
        hub.send("a1", &msg).await.unwrap();
        tokio::task::yield_now().await;

        drop(in_tx);
        demux.await.unwrap();
        assert!(connection.is_cancelled());
        // Still listed until the supervisor joins the stuck writer.
        assert!(hub.connection("a1").await.is_some());
        assert!(!hub.is_connected("a1").await);

        assert!(matches!(
            router.open_route("s1", "a1").await,
            Err(HubError::AgentNotConnected(_))
        ));
        assert_eq!(router.open_count().await, 0);
        let session = store.find_session("s1").await.unwrap().unwrap();
        assert_eq!(session.active_connections, 0);
    }

    #[tokio::test]
    async fn test_stale_ownership_check_spares_replacement() {
        let (_hub, _store, router, _agent) = setup().await;
        let first = router.open_route("s1", "a1").await.unwrap();
        let checked = router.route_served_by("s1", "a1").await;
        assert_eq!(checked, Some(first.route_id));
        assert_eq!(router.route_served_by("s1", "a2").await, None);

        // A replacement lands between the check and the close.
        let second = router.open_route("s1", "a1").await.unwrap();
        assert!(
            !router
                .close_route_if("s1", first.route_id, CloseReason::SessionTerminated)
                .await
        );
        assert_eq!(router.open_count().await, 1);
        assert!(second.closed.borrow().is_none());
    }

    #[tokio::test]
    async fn test_open_route_requires_connected_agent() {
        let (_hub, _store, router, _agent) = setup().await;
        assert!(matches!(
            router.open_route("s2", "a2").await,
            Err(HubError::AgentNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_second_route_replaces_first() {
        let (_hub, store, router, _agent) = setup().await;
        let mut first = router.open_route("s1", "a1").await.unwrap();
        let second = router.open_route("s1", "a1").await.unwrap();

        assert_eq!(
            wait_closed(&mut first).await,
            CloseReason::ReplacedByNewConnection
        );
        assert_eq!(router.open_count().await, 1);
        // The stale relay exiting must not tear down its replacement.
        assert!(
            !router
                .close_route_if("s1", first.route_id, CloseReason::ClientDisconnect)
                .await
        );
        assert!(second.closed.borrow().is_none());
        let session = store.find_session("s1").await.unwrap().unwrap();
        assert_eq!(session.active_connections, 1);
    }

    #[tokio::test]
    async fn test_agent_unregister_closes_route() {
        let (hub, _store, router, _agent) = setup().await;
        let mut handle = router.open_route("s1", "a1").await.unwrap();

        hub.unregister("a1").await;
        assert_eq!(wait_closed(&mut handle).await, CloseReason::AgentDisconnected);
        assert_eq!(router.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_client_close_notifies_agent() {
        let (_hub, store, router, mut agent) = setup().await;
        let _handle = router.open_route("s1", "a1").await.unwrap();
        assert!(router.close_route("s1", CloseReason::ClientDisconnect).await);
        assert!(!router.close_route("s1", CloseReason::ClientDisconnect).await);

        let text = agent.next_text().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "vnc_close");
        assert_eq!(value["payload"]["reason"], "client_disconnect");
        let session = store.find_session("s1").await.unwrap().unwrap();
        assert_eq!(session.active_connections, 0);
    }

    #[tokio::test]
    async fn test_frames_for_unknown_session_are_counted() {
        let (_hub, _store, router, _agent) = setup().await;
        let frame = TunnelFrame::Data(VncDataPayload::from_bytes("ghost", b"x"));
        router.deliver("a1", frame).await;
        assert_eq!(router.dropped_frames(), 1);
    }

    #[tokio::test]
    async fn test_frames_from_wrong_agent_are_dropped() {
        let (_hub, _store, router, _agent) = setup().await;
        let mut handle = router.open_route("s1", "a1").await.unwrap();
        let frame = TunnelFrame::Data(VncDataPayload::from_bytes("s1", b"x"));
        router.deliver("a2", frame).await;
        assert_eq!(router.dropped_frames(), 1);
        assert!(handle.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_vnc_error_closes_route() {
        let (_hub, _store, router, agent) = setup().await;
        let mut handle = router.open_route("s1", "a1").await.unwrap();
        agent
            .send_text(r#"{"type":"vnc_error","payload":{"sessionId":"s1","error":"port-forward failed"}}"#)
            .await;
        assert_eq!(wait_closed(&mut handle).await, CloseReason::TunnelError);
    }
}
