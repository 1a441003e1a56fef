//! Inbound control dispatch.
//!
//! [`ControlPlane`] is the [`ControlHandler`] every agent read pump calls
//! into. Heartbeats refresh the agent record, command replies advance the
//! [`CommandTracker`], and `status` reports update the session record (and
//! end the session's tunnel once it stops running).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::commands::CommandTracker;
use crate::hub::{AgentHub, ControlHandler};
use crate::protocol::{ControlFrame, HeartbeatPayload, StatusPayload};
use crate::store::{AgentStore, SessionStore};
use crate::tunnel::{CloseReason, TunnelRouter};
use crate::util::now_ms;

pub struct ControlPlane {
    hub: AgentHub,
    agents: Arc<dyn AgentStore>,
    sessions: Arc<dyn SessionStore>,
    tracker: CommandTracker,
    tunnels: TunnelRouter,
}

impl ControlPlane {
    pub fn new(
        hub: AgentHub,
        agents: Arc<dyn AgentStore>,
        sessions: Arc<dyn SessionStore>,
        tracker: CommandTracker,
        tunnels: TunnelRouter,
    ) -> Self {
        Self {
            hub,
            agents,
            sessions,
            tracker,
            tunnels,
        }
    }

    async fn on_heartbeat(&self, agent_id: &str, hb: HeartbeatPayload) {
        debug!(
            agent_id = %agent_id,
            status = %hb.status,
            active_sessions = hb.active_sessions,
            "Heartbeat"
        );
        if !self.hub.update_heartbeat(agent_id).await {
            debug!(agent_id = %agent_id, "Heartbeat from an agent no longer registered");
        }
        if let Err(e) = self
            .agents
            .record_heartbeat(agent_id, now_ms(), hb.capacity)
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "Failed to record heartbeat");
        }
    }

    async fn on_status(&self, agent_id: &str, status: StatusPayload) {
        let session = match self.sessions.find_session(&status.session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(session_id = %status.session_id, "Status for unknown session ignored");
                return;
            }
            Err(e) => {
                warn!(session_id = %status.session_id, error = %e, "Session lookup failed");
                return;
            }
        };
        if session.agent_id.as_deref() != Some(agent_id) {
            warn!(
                agent_id = %agent_id,
                session_id = %status.session_id,
                "Status from an agent not assigned to the session ignored"
            );
            return;
        }

        if let Err(e) = self
            .sessions
            .update_session_state(&status.session_id, &status.state)
            .await
        {
            warn!(session_id = %status.session_id, error = %e, "Failed to update session state");
        }
        debug!(
            session_id = %status.session_id,
            state = %status.state,
            vnc_ready = status.vnc_ready,
            "Session status"
        );

        if status.state == "running" {
            return;
        }
        if let Some(route_id) = self
            .tunnels
            .route_served_by(&status.session_id, agent_id)
            .await
        {
            self.tunnels
                .close_route_if(&status.session_id, route_id, CloseReason::SessionTerminated)
                .await;
        }
    }
}

#[async_trait]
impl ControlHandler for ControlPlane {
    async fn on_control(&self, agent_id: &str, frame: ControlFrame) {
        match frame {
            ControlFrame::Heartbeat(hb) => self.on_heartbeat(agent_id, hb).await,
            ControlFrame::Ack(p) => self.tracker.on_ack(agent_id, &p.command_id).await,
            ControlFrame::Complete(p) => {
                self.tracker
                    .on_complete(agent_id, &p.command_id, p.result)
                    .await;
            }
            ControlFrame::Failed(p) => {
                self.tracker
                    .on_failed(agent_id, &p.command_id, p.error)
                    .await;
            }
            ControlFrame::Status(s) => self.on_status(agent_id, s).await,
        }
    }
}
