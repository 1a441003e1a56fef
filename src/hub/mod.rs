//! Agent registry.
//!
//! [`AgentHub`] is the process-wide directory of connected agents. Each entry
//! is an [`AgentConnection`] owning the outbound queue and the cancellation
//! token of one agent's transport. Two pump tasks (see [`pumps`]) move frames
//! between that queue and the socket; a supervisor task joins them and
//! removes the entry when either pump ends.
//!
//! Replacement is generation-based: a second registration for the same id
//! evicts the first entry and cancels its pumps. When the evicted pumps
//! finally exit they call [`AgentHub::unregister_connection`] with their own
//! generation, which is a no-op because the map now holds a newer one.

pub mod pumps;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::protocol::{ControlFrame, HubMessage, TunnelFrame};
use crate::store::{AgentStatus, AgentStore, Platform};

/// Receives control-class frames from the read pump.
///
/// Called inline by the pump, so frames of one agent are handled in arrival
/// order.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn on_control(&self, agent_id: &str, frame: ControlFrame);
}

/// Pump timing and queue sizes.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub outbound_queue: usize,
    pub inbound_queue: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
}

impl From<&HubConfig> for HubOptions {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            outbound_queue: cfg.outbound_queue.max(1),
            inbound_queue: cfg.inbound_queue.max(1),
            read_timeout: cfg.read_timeout(),
            write_timeout: cfg.write_timeout(),
            ping_interval: cfg.ping_interval(),
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

/// State for one agent's transport.
pub struct AgentConnection {
    pub agent_id: String,
    pub platform: Platform,
    /// Distinguishes this connection from earlier and later ones for the same id.
    pub generation: u64,
    pub connected_since: Instant,
    outbound: mpsc::Sender<String>,
    /// Milliseconds since the hub epoch (lock-free, monotonic).
    last_heartbeat_ms: AtomicU64,
    epoch: Instant,
    dropped_outbound: AtomicU64,
    dropped_inbound: AtomicU64,
    /// Stops both pumps.
    cancel: CancellationToken,
    /// Cancelled by the supervisor once both pumps have been joined.
    stopped: CancellationToken,
}

impl AgentConnection {
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record a heartbeat now. Never moves the timestamp backwards.
    pub fn record_heartbeat(&self) -> u64 {
        let now = self.elapsed_ms();
        self.last_heartbeat_ms.fetch_max(now, Ordering::AcqRel).max(now)
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    /// Time since the last heartbeat (or since connect if none arrived yet).
    pub fn heartbeat_age(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms().saturating_sub(self.last_heartbeat_ms()))
    }

    /// Frames currently waiting in the outbound queue.
    pub fn queue_depth(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    pub fn dropped_outbound(&self) -> u64 {
        self.dropped_outbound.load(Ordering::Relaxed)
    }

    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    pub(crate) fn count_dropped_inbound(&self) {
        self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once both pumps have exited.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    fn enqueue(&self, text: String) -> Result<(), HubError> {
        match self.outbound.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                Err(HubError::QueueFull(self.agent_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::Transport(format!(
                "write side of agent {} is closed",
                self.agent_id
            ))),
        }
    }
}

/// Point-in-time view of a connection, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub platform: Platform,
    pub connected_secs: u64,
    pub heartbeat_age_secs: u64,
    pub queue_depth: usize,
    pub dropped_outbound: u64,
    pub dropped_inbound: u64,
}

/// Outcome of a successful [`AgentHub::register`].
pub struct Registered {
    pub connection: Arc<AgentConnection>,
    /// Tunnel frames read from this agent, in arrival order.
    pub inbound: mpsc::Receiver<TunnelFrame>,
}

/// Marks an agent id as mid-upgrade. Dropping the guard clears the mark.
pub struct RegistrationGuard {
    agent_id: String,
    inner: Arc<Inner>,
}

impl RegistrationGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if let Ok(mut registering) = self.inner.registering.lock() {
            registering.remove(&self.agent_id);
        }
    }
}

struct Inner {
    agents: RwLock<HashMap<String, Arc<AgentConnection>>>,
    registering: Mutex<HashSet<String>>,
    next_generation: AtomicU64,
    epoch: Instant,
    options: HubOptions,
    store: Arc<dyn AgentStore>,
    events: broadcast::Sender<Value>,
}

/// Registry of live agent connections. Cheap to clone.
#[derive(Clone)]
pub struct AgentHub {
    inner: Arc<Inner>,
}

impl AgentHub {
    pub fn new(
        options: HubOptions,
        store: Arc<dyn AgentStore>,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agents: RwLock::new(HashMap::new()),
                registering: Mutex::new(HashSet::new()),
                next_generation: AtomicU64::new(1),
                epoch: Instant::now(),
                options,
                store,
                events,
            }),
        }
    }

    pub fn options(&self) -> &HubOptions {
        &self.inner.options
    }

    /// Claim the right to register `agent_id`.
    ///
    /// Fails with [`HubError::AlreadyRegistering`] while another upgrade for
    /// the same id holds a guard.
    pub fn begin_registration(&self, agent_id: &str) -> Result<RegistrationGuard, HubError> {
        let mut registering = self
            .inner
            .registering
            .lock()
            .map_err(|_| HubError::Unavailable("registration table poisoned".into()))?;
        if !registering.insert(agent_id.to_string()) {
            return Err(HubError::AlreadyRegistering(agent_id.to_string()));
        }
        Ok(RegistrationGuard {
            agent_id: agent_id.to_string(),
            inner: self.inner.clone(),
        })
    }

    /// Install a new connection for the guarded agent id and start its pumps.
    ///
    /// Any existing entry for the id is evicted and its transport closed.
    /// The agent is marked `online` in the store.
    pub async fn register<S, R, E>(
        &self,
        guard: RegistrationGuard,
        platform: Platform,
        sink: S,
        stream: R,
        handler: Arc<dyn ControlHandler>,
    ) -> Registered
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: Display + Send + 'static,
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let opts = &self.inner.options;
        let agent_id = guard.agent_id.clone();
        let (outbound_tx, outbound_rx) = mpsc::channel(opts.outbound_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(opts.inbound_queue);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let epoch = self.inner.epoch;

        let conn = Arc::new(AgentConnection {
            agent_id: agent_id.clone(),
            platform,
            generation,
            connected_since: Instant::now(),
            outbound: outbound_tx,
            last_heartbeat_ms: AtomicU64::new(epoch.elapsed().as_millis() as u64),
            epoch,
            dropped_outbound: AtomicU64::new(0),
            dropped_inbound: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        });

        let evicted = {
            let mut agents = self.inner.agents.write().await;
            agents.insert(agent_id.clone(), conn.clone())
        };
        if let Some(old) = evicted {
            warn!(
                agent_id = %agent_id,
                old_generation = old.generation,
                "Agent re-registering while a connection exists, evicting old"
            );
            old.cancel.cancel();
        }

        let write = tokio::spawn(
            pumps::write_pump(
                conn.clone(),
                sink,
                outbound_rx,
                opts.ping_interval,
                opts.write_timeout,
            )
            .in_current_span(),
        );
        let read = tokio::spawn(
            pumps::read_pump(conn.clone(), stream, inbound_tx, handler, opts.read_timeout)
                .in_current_span(),
        );
        let hub = self.clone();
        let supervised = conn.clone();
        tokio::spawn(
            async move {
                let (w, r) = tokio::join!(write, read);
                if let Err(e) = w.and(r) {
                    warn!(agent_id = %supervised.agent_id, error = %e, "Agent pump panicked");
                }
                hub.unregister_connection(&supervised.agent_id, supervised.generation)
                    .await;
                supervised.stopped.cancel();
            }
            .in_current_span(),
        );

        if let Err(e) = self
            .inner
            .store
            .set_agent_status(&agent_id, AgentStatus::Online)
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "Failed to mark agent online");
        }
        info!(
            agent_id = %agent_id,
            platform = platform.as_str(),
            generation,
            "Agent registered"
        );
        self.emit(json!({
            "type": "agent.connected",
            "agent_id": agent_id,
            "platform": platform.as_str(),
        }));

        drop(guard);
        Registered {
            connection: conn,
            inbound: inbound_rx,
        }
    }

    /// Remove the agent's entry, close its transport and mark it `offline`.
    ///
    /// Idempotent: returns `false` (with no side effects) if the agent was
    /// not registered. Waits for the pumps to be joined.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.inner.agents.write().await.remove(agent_id);
        let Some(conn) = removed else {
            return false;
        };
        self.finish_unregister(&conn, "unregistered").await;
        if tokio::time::timeout(self.inner.options.write_timeout, conn.stopped())
            .await
            .is_err()
        {
            warn!(agent_id = %agent_id, "Agent pumps did not stop in time");
        }
        true
    }

    /// Remove the entry only if it still belongs to `generation`.
    ///
    /// Called by the pump supervisor so that a replaced connection never
    /// removes its successor.
    pub async fn unregister_connection(&self, agent_id: &str, generation: u64) -> bool {
        let removed = {
            let mut agents = self.inner.agents.write().await;
            match agents.get(agent_id) {
                Some(c) if c.generation == generation => agents.remove(agent_id),
                _ => None,
            }
        };
        let Some(conn) = removed else {
            return false;
        };
        self.finish_unregister(&conn, "connection closed").await;
        true
    }

    async fn finish_unregister(&self, conn: &AgentConnection, reason: &str) {
        conn.cancel.cancel();
        if let Err(e) = self
            .inner
            .store
            .set_agent_status(&conn.agent_id, AgentStatus::Offline)
            .await
        {
            warn!(agent_id = %conn.agent_id, error = %e, "Failed to mark agent offline");
        }
        info!(
            agent_id = %conn.agent_id,
            generation = conn.generation,
            reason,
            "Agent unregistered"
        );
        self.emit(json!({
            "type": "agent.disconnected",
            "agent_id": conn.agent_id,
            "reason": reason,
        }));
    }

    /// Enqueue a message for the agent without blocking.
    pub async fn send(&self, agent_id: &str, msg: &HubMessage) -> Result<(), HubError> {
        let text = msg.encode()?;
        let agents = self.inner.agents.read().await;
        let conn = agents
            .get(agent_id)
            .ok_or_else(|| HubError::AgentNotConnected(agent_id.to_string()))?;
        conn.enqueue(text)
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.inner
            .agents
            .read()
            .await
            .get(agent_id)
            .is_some_and(|c| !c.is_cancelled())
    }

    /// Bump the agent's heartbeat clock. Returns `false` if not connected.
    pub async fn update_heartbeat(&self, agent_id: &str) -> bool {
        match self.inner.agents.read().await.get(agent_id) {
            Some(conn) => {
                conn.record_heartbeat();
                true
            }
            None => false,
        }
    }

    pub async fn connection(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.inner.agents.read().await.get(agent_id).cloned()
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.agents.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<AgentSnapshot> {
        let agents = self.inner.agents.read().await;
        let mut list: Vec<AgentSnapshot> = agents
            .values()
            .map(|c| AgentSnapshot {
                agent_id: c.agent_id.clone(),
                platform: c.platform,
                connected_secs: c.connected_since.elapsed().as_secs(),
                heartbeat_age_secs: c.heartbeat_age().as_secs(),
                queue_depth: c.queue_depth(),
                dropped_outbound: c.dropped_outbound(),
                dropped_inbound: c.dropped_inbound(),
            })
            .collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    /// Unregister agents whose heartbeat is older than `timeout`.
    /// Returns the ids of evicted agents.
    ///
    /// Single write-lock pass so a heartbeat landing between the check and the
    /// removal cannot be lost to a separate read phase.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let stale: Vec<Arc<AgentConnection>> = {
            let mut agents = self.inner.agents.write().await;
            let ids: Vec<String> = agents
                .iter()
                .filter(|(_, c)| c.heartbeat_age() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| agents.remove(id)).collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for conn in stale {
            warn!(agent_id = %conn.agent_id, "Evicted agent (heartbeat timeout)");
            self.finish_unregister(&conn, "heartbeat timeout").await;
            evicted.push(conn.agent_id.clone());
        }
        evicted
    }

    /// Send a message to every connected agent. Failures are logged.
    pub async fn broadcast(&self, msg: &HubMessage) -> usize {
        let text = match msg.encode() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast");
                return 0;
            }
        };
        let agents = self.inner.agents.read().await;
        let mut delivered = 0;
        for (agent_id, conn) in agents.iter() {
            match conn.enqueue(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to send broadcast"),
            }
        }
        delivered
    }

    /// Unregister every agent (used during shutdown).
    pub async fn drain_all(&self) {
        let drained: Vec<Arc<AgentConnection>> = {
            let mut agents = self.inner.agents.write().await;
            agents.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            self.finish_unregister(conn, "hub shutting down").await;
        }
        let wait = self.inner.options.write_timeout;
        for conn in &drained {
            let _ = tokio::time::timeout(wait, conn.stopped()).await;
        }
    }

    fn emit(&self, event: Value) {
        let _ = self.inner.events.send(event);
    }
}
