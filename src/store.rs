//! Collaborator stores consumed by the hub.
//!
//! The hub only ever talks to persistence through three narrow traits:
//! [`AgentStore`] (agent lookup, online/offline, heartbeat capacity),
//! [`SessionStore`] (ownership, state, connection count) and
//! [`CommandStore`] (command lifecycle records). [`MemoryStore`] implements
//! all three and is seeded from the `[inventory]` config section.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::commands::Command;
use crate::config::InventoryConfig;
use crate::protocol::AgentCapacity;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Platform an agent fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Kubernetes,
    Docker,
    Hyperv,
    Vcenter,
    Custom,
}

impl Platform {
    /// Unrecognized names map to [`Platform::Custom`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Self::Kubernetes,
            "docker" => Self::Docker,
            "hyperv" | "hyper-v" => Self::Hyperv,
            "vcenter" | "vsphere" => Self::Vcenter,
            _ => Self::Custom,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Docker => "docker",
            Self::Hyperv => "hyperv",
            Self::Vcenter => "vcenter",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    pub platform: Platform,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<AgentCapacity>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub owner: String,
    pub state: String,
    pub agent_id: Option<String>,
    pub active_connections: u32,
}

impl SessionRecord {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn find_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError>;
    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus)
        -> Result<(), StoreError>;
    /// Record a heartbeat; also re-asserts `online`.
    async fn record_heartbeat(
        &self,
        agent_id: &str,
        at_ms: u64,
        capacity: Option<AgentCapacity>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn update_session_state(&self, session_id: &str, state: &str) -> Result<(), StoreError>;
    /// Add `delta` to the session's open connection count, floored at zero.
    async fn adjust_connections(&self, session_id: &str, delta: i32) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert_command(&self, command: &Command) -> Result<(), StoreError>;
    async fn update_command(&self, command: &Command) -> Result<(), StoreError>;
    async fn find_command(&self, command_id: &str) -> Result<Option<Command>, StoreError>;
}

/// Handles to every collaborator store, cloned into each component.
#[derive(Clone)]
pub struct Stores {
    pub agents: Arc<dyn AgentStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub commands: Arc<dyn CommandStore>,
}

impl Stores {
    pub fn memory(store: &Arc<MemoryStore>) -> Self {
        Self {
            agents: store.clone(),
            sessions: store.clone(),
            commands: store.clone(),
        }
    }
}

/// In-process implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<String, AgentRecord>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    commands: RwLock<HashMap<String, Command>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inventory(inventory: &InventoryConfig) -> Self {
        let agents = inventory
            .agents
            .iter()
            .map(|a| {
                let record = AgentRecord {
                    agent_id: a.agent_id.clone(),
                    platform: Platform::parse(&a.platform),
                    region: a.region.clone(),
                    status: AgentStatus::Offline,
                    last_heartbeat_ms: None,
                    capacity: None,
                };
                (a.agent_id.clone(), record)
            })
            .collect();
        let sessions = inventory
            .sessions
            .iter()
            .map(|s| {
                let record = SessionRecord {
                    session_id: s.session_id.clone(),
                    owner: s.owner.clone(),
                    state: s.state.clone(),
                    agent_id: s.agent_id.clone(),
                    active_connections: 0,
                };
                (s.session_id.clone(), record)
            })
            .collect();
        Self {
            agents: RwLock::new(agents),
            sessions: RwLock::new(sessions),
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub async fn put_agent(&self, agent_id: &str, platform: Platform) {
        self.agents.write().await.insert(
            agent_id.to_string(),
            AgentRecord {
                agent_id: agent_id.to_string(),
                platform,
                region: None,
                status: AgentStatus::Offline,
                last_heartbeat_ms: None,
                capacity: None,
            },
        );
    }

    pub async fn put_session(&self, session_id: &str, owner: &str, state: &str, agent_id: &str) {
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionRecord {
                session_id: session_id.to_string(),
                owner: owner.to_string(),
                state: state.to_string(),
                agent_id: Some(agent_id.to_string()),
                active_connections: 0,
            },
        );
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn find_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn set_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(agent_id.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        agent_id: &str,
        at_ms: u64,
        capacity: Option<AgentCapacity>,
    ) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(agent_id.to_string()))?;
        record.status = AgentStatus::Online;
        record.last_heartbeat_ms = Some(record.last_heartbeat_ms.unwrap_or(0).max(at_ms));
        if capacity.is_some() {
            record.capacity = capacity;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn update_session_state(&self, session_id: &str, state: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        record.state = state.to_string();
        Ok(())
    }

    async fn adjust_connections(&self, session_id: &str, delta: i32) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        record.active_connections = record.active_connections.saturating_add_signed(delta);
        Ok(())
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn insert_command(&self, command: &Command) -> Result<(), StoreError> {
        self.commands
            .write()
            .await
            .insert(command.command_id.clone(), command.clone());
        Ok(())
    }

    async fn update_command(&self, command: &Command) -> Result<(), StoreError> {
        let mut commands = self.commands.write().await;
        let slot = commands
            .get_mut(&command.command_id)
            .ok_or_else(|| StoreError::NotFound(command.command_id.clone()))?;
        *slot = command.clone();
        Ok(())
    }

    async fn find_command(&self, command_id: &str) -> Result<Option<Command>, StoreError> {
        Ok(self.commands.read().await.get(command_id).cloned())
    }
}
