//! Command lifecycle tracking.
//!
//! A command is persisted as `pending` before it is enqueued to the agent,
//! then advanced by the agent's `ack`/`complete`/`failed` replies. Status only
//! moves forward; replies for unknown or already-terminal commands are logged
//! and ignored. The in-memory buffer holds non-terminal commands until they
//! finish or exceed the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::hub::AgentHub;
use crate::protocol::{CommandPayload, HubMessage};
use crate::store::CommandStore;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Ack,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only: pending → ack → {completed | failed}. Pending may skip
    /// straight to a terminal state when the ack is lost.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Ack | Self::Completed | Self::Failed) => true,
            (Self::Ack, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ack => "ack",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Persisted command record. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub args: Value,
    pub status: CommandStatus,
    pub issued_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// What a caller asks an agent to do.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub args: Value,
}

/// Reply observed from the agent.
#[derive(Debug, Clone)]
pub enum Transition {
    Ack,
    Complete(Option<Value>),
    Failed(String),
}

impl Transition {
    fn target(&self) -> CommandStatus {
        match self {
            Self::Ack => CommandStatus::Ack,
            Self::Complete(_) => CommandStatus::Completed,
            Self::Failed(_) => CommandStatus::Failed,
        }
    }
}

/// A buffered command. Its own lock serializes replies for that command,
/// including the store write, without holding the buffer map.
struct Inflight {
    command: Arc<Mutex<Command>>,
    buffered_at: Instant,
}

/// Correlates dispatched commands with agent replies.
#[derive(Clone)]
pub struct CommandTracker {
    hub: AgentHub,
    store: Arc<dyn CommandStore>,
    inflight: Arc<Mutex<HashMap<String, Inflight>>>,
    timeout: Duration,
    events: broadcast::Sender<Value>,
}

impl CommandTracker {
    pub fn new(
        hub: AgentHub,
        store: Arc<dyn CommandStore>,
        timeout: Duration,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            hub,
            store,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            events,
        }
    }

    /// Persist `request` as a pending command and enqueue it to the agent.
    ///
    /// If the agent is not connected (or its queue is full) the command is
    /// recorded as failed and the error is returned to the caller.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        request: CommandRequest,
    ) -> Result<Command, HubError> {
        if request.action.trim().is_empty() {
            return Err(HubError::BadRequest("action is required".into()));
        }
        let mut command = Command {
            command_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            session_id: request.session_id,
            action: request.action,
            args: request.args,
            status: CommandStatus::Pending,
            issued_at: now_ms(),
            acknowledged_at: None,
            completed_at: None,
            result: None,
            error_message: None,
        };
        self.store.insert_command(&command).await?;

        let msg = HubMessage::Command(CommandPayload {
            command_id: command.command_id.clone(),
            session_id: command.session_id.clone(),
            action: command.action.clone(),
            args: command.args.clone(),
        });

        // Buffer before sending so a fast reply always finds the entry.
        self.inflight.lock().await.insert(
            command.command_id.clone(),
            Inflight {
                command: Arc::new(Mutex::new(command.clone())),
                buffered_at: Instant::now(),
            },
        );

        if let Err(e) = self.hub.send(agent_id, &msg).await {
            self.inflight.lock().await.remove(&command.command_id);
            command.status = CommandStatus::Failed;
            command.completed_at = Some(now_ms());
            command.error_message = Some(e.to_string());
            if let Err(store_err) = self.store.update_command(&command).await {
                warn!(command_id = %command.command_id, error = %store_err, "Failed to persist command failure");
            }
            warn!(
                agent_id = %agent_id,
                command_id = %command.command_id,
                error = %e,
                "Command dispatch failed"
            );
            return Err(e);
        }

        info!(
            agent_id = %agent_id,
            command_id = %command.command_id,
            action = %command.action,
            "Command dispatched"
        );
        Ok(command)
    }

    pub async fn on_ack(&self, agent_id: &str, command_id: &str) {
        self.apply(agent_id, command_id, Transition::Ack).await;
    }

    pub async fn on_complete(&self, agent_id: &str, command_id: &str, result: Option<Value>) {
        self.apply(agent_id, command_id, Transition::Complete(result))
            .await;
    }

    pub async fn on_failed(&self, agent_id: &str, command_id: &str, error: String) {
        self.apply(agent_id, command_id, Transition::Failed(error))
            .await;
    }

    /// Apply a reply. Returns the new status, or `None` if it was ignored.
    ///
    /// Replies for one command are serialized on that command's lock; the
    /// buffer map is only locked for lookup and removal.
    pub async fn apply(
        &self,
        agent_id: &str,
        command_id: &str,
        transition: Transition,
    ) -> Option<CommandStatus> {
        let slot = self
            .inflight
            .lock()
            .await
            .get(command_id)
            .map(|e| e.command.clone());
        let Some(slot) = slot else {
            debug!(agent_id = %agent_id, command_id = %command_id, "Reply for unknown or finished command ignored");
            return None;
        };
        let mut command = slot.lock().await;
        if command.agent_id != agent_id {
            warn!(
                agent_id = %agent_id,
                owner = %command.agent_id,
                command_id = %command_id,
                "Reply from an agent that does not own the command ignored"
            );
            return None;
        }

        let next = transition.target();
        let current = command.status;
        if !current.can_transition_to(next) {
            debug!(
                command_id = %command_id,
                from = current.as_str(),
                to = next.as_str(),
                "Non-forward command transition ignored"
            );
            return None;
        }

        let now = now_ms();
        command.status = next;
        match transition {
            Transition::Ack => command.acknowledged_at = Some(now),
            Transition::Complete(result) => {
                command.completed_at = Some(now);
                command.result = result;
            }
            Transition::Failed(error) => {
                command.completed_at = Some(now);
                command.error_message = Some(error);
            }
        }

        if let Err(e) = self.store.update_command(&command).await {
            warn!(command_id = %command_id, error = %e, "Failed to persist command transition");
        }

        if next.is_terminal() {
            self.inflight.lock().await.remove(command_id);
            info!(
                agent_id = %agent_id,
                command_id = %command_id,
                status = next.as_str(),
                "Command finished"
            );
            let event_type = if next == CommandStatus::Completed {
                "command.completed"
            } else {
                "command.failed"
            };
            let _ = self.events.send(json!({
                "type": event_type,
                "command_id": command.command_id,
                "agent_id": command.agent_id,
                "action": command.action,
                "error": command.error_message,
            }));
        }
        Some(next)
    }

    /// Drop buffered commands older than the timeout. Returns their ids.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let timeout = self.timeout;
        let mut inflight = self.inflight.lock().await;
        let expired: Vec<String> = inflight
            .iter()
            .filter(|(_, e)| e.buffered_at.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inflight.remove(id);
            warn!(command_id = %id, "Command timed out waiting for agent reply");
        }
        expired
    }

    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }

    pub async fn find(&self, command_id: &str) -> Result<Option<Command>, HubError> {
        Ok(self.store.find_command(command_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{connect_mock, test_hub, RecordingHandler};
    use crate::store::{MemoryStore, StoreError};

    fn tracker(hub: &AgentHub, store: &Arc<MemoryStore>, timeout: Duration) -> CommandTracker {
        let (events, _) = broadcast::channel(16);
        CommandTracker::new(hub.clone(), store.clone(), timeout, events)
    }

    fn request(action: &str) -> CommandRequest {
        CommandRequest {
            action: action.into(),
            session_id: Some("s1".into()),
            args: json!({"template": "firefox"}),
        }
    }

    #[test]
    fn test_transitions_forward_only() {
        use CommandStatus::*;
        assert!(Pending.can_transition_to(Ack));
        assert!(Pending.can_transition_to(Failed));
        assert!(Ack.can_transition_to(Completed));
        assert!(!Ack.can_transition_to(Pending));
        assert!(!Ack.can_transition_to(Ack));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[tokio::test]
    async fn test_dispatch_sends_command_frame() {
        let (hub, store) = test_hub().await;
        let (_reg, mut agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        let tracker = tracker(&hub, &store, Duration::from_secs(300));

        let cmd = tracker.dispatch("a1", request("start_session")).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);

        let text = agent.next_text().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["payload"]["commandId"], cmd.command_id.as_str());
        assert_eq!(value["payload"]["action"], "start_session");

        let stored = store.find_command(&cmd.command_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Pending);
        assert_eq!(tracker.inflight_count().await, 1);
    }

    #[tokio::test]
    async fn test_dispatch_to_disconnected_agent() {
        let (hub, store) = test_hub().await;
        let tracker = tracker(&hub, &store, Duration::from_secs(300));
        let err = tracker.dispatch("a1", request("stop_session")).await.unwrap_err();
        assert!(matches!(err, HubError::AgentNotConnected(_)));
        assert_eq!(tracker.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_and_terminal_noop() {
        let (hub, store) = test_hub().await;
        let (_reg, _agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        let tracker = tracker(&hub, &store, Duration::from_secs(300));
        let id = tracker.dispatch("a1", request("start_session")).await.unwrap().command_id;

        assert_eq!(
            tracker.apply("a1", &id, Transition::Ack).await,
            Some(CommandStatus::Ack)
        );
        // Duplicate ack is a no-op.
        assert_eq!(tracker.apply("a1", &id, Transition::Ack).await, None);
        // Wrong agent is ignored.
        assert_eq!(
            tracker.apply("a2", &id, Transition::Complete(None)).await,
            None
        );
        assert_eq!(
            tracker
                .apply("a1", &id, Transition::Complete(Some(json!({"podName": "p"}))))
                .await,
            Some(CommandStatus::Completed)
        );
        // Anything after terminal is ignored.
        assert_eq!(
            tracker.apply("a1", &id, Transition::Failed("late".into())).await,
            None
        );

        let stored = store.find_command(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.acknowledged_at.is_some());
        assert!(stored.completed_at.is_some());
        assert!(stored.error_message.is_none());
        assert_eq!(tracker.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_records_error_and_emits_event() {
        let (hub, store) = test_hub().await;
        let (_reg, _agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        let (events, mut rx) = broadcast::channel(16);
        let tracker =
            CommandTracker::new(hub.clone(), store.clone(), Duration::from_secs(300), events);
        let id = tracker.dispatch("a1", request("start_session")).await.unwrap().command_id;

        tracker.on_failed("a1", &id, "image pull failed".into()).await;
        let stored = store.find_command(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("image pull failed"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "command.failed");
        assert_eq!(event["command_id"], id.as_str());
    }

    #[tokio::test]
    async fn test_unknown_command_ignored() {
        let (hub, store) = test_hub().await;
        let tracker = tracker(&hub, &store, Duration::from_secs(300));
        assert_eq!(tracker.apply("a1", "nope", Transition::Ack).await, None);
    }

    /// Memory store whose writes for one command block until released.
    struct StallingStore {
        inner: Arc<MemoryStore>,
        stalled_action: &'static str,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl CommandStore for StallingStore {
        async fn insert_command(&self, command: &Command) -> Result<(), StoreError> {
            self.inner.insert_command(command).await
        }

        async fn update_command(&self, command: &Command) -> Result<(), StoreError> {
            if command.action == self.stalled_action {
                self.release.notified().await;
            }
            self.inner.update_command(command).await
        }

        async fn find_command(&self, command_id: &str) -> Result<Option<Command>, StoreError> {
            self.inner.find_command(command_id).await
        }
    }

    #[tokio::test]
    async fn test_slow_store_write_does_not_block_other_commands() {
        let (hub, store) = test_hub().await;
        let (_reg, _agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        let stalling = Arc::new(StallingStore {
            inner: store.clone(),
            stalled_action: "slow",
            release: tokio::sync::Notify::new(),
        });
        let (events, _) = broadcast::channel(16);
        let tracker = CommandTracker::new(
            hub.clone(),
            stalling.clone(),
            Duration::from_secs(300),
            events,
        );
        let slow = tracker.dispatch("a1", request("slow")).await.unwrap().command_id;
        let fast = tracker.dispatch("a1", request("fast")).await.unwrap().command_id;

        let stuck = tokio::spawn({
            let tracker = tracker.clone();
            let slow = slow.clone();
            async move { tracker.apply("a1", &slow, Transition::Ack).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let applied = tokio::time::timeout(
            Duration::from_secs(2),
            tracker.apply("a1", &fast, Transition::Complete(None)),
        )
        .await
        .expect("reply for another command must not wait on the stalled write");
        assert_eq!(applied, Some(CommandStatus::Completed));

        // A second reply for the stalled command queues behind the first.
        let follow = tokio::spawn({
            let tracker = tracker.clone();
            let slow = slow.clone();
            async move { tracker.apply("a1", &slow, Transition::Complete(None)).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        stalling.release.notify_waiters();
        assert_eq!(stuck.await.unwrap(), Some(CommandStatus::Ack));
        stalling.release.notify_one();
        assert_eq!(follow.await.unwrap(), Some(CommandStatus::Completed));

        let stored = store.find_command(&slow).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (hub, store) = test_hub().await;
        let (_reg, _agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        let tracker = tracker(&hub, &store, Duration::from_millis(10));
        let id = tracker.dispatch("a1", request("start_session")).await.unwrap().command_id;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.sweep_expired().await, vec![id.clone()]);
        assert_eq!(tracker.inflight_count().await, 0);
        // Store still reports the last known status.
        let stored = store.find_command(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Pending);
    }
}
