//! Agent wire protocol.
//!
//! Every frame exchanged with an agent is a JSON envelope:
//!
//! ```json
//! {"type": "<kind>", "payload": { ... }}
//! ```
//!
//! Payload field names are camelCase. Frames are decoded exactly once, at the
//! read pump, into [`AgentMessage`] and then split into a [`ControlFrame`]
//! (handled synchronously) or a [`TunnelFrame`] (queued for the tunnel
//! router).
//!
//! ## Agent → hub
//!
//! | Type        | Payload                                          | Class   |
//! |-------------|--------------------------------------------------|---------|
//! | `heartbeat` | `status`, `activeSessions`, `capacity?`          | control |
//! | `ack`       | `commandId`                                      | control |
//! | `complete`  | `commandId`, `result?`                           | control |
//! | `failed`    | `commandId`, `error`                             | control |
//! | `status`    | `sessionId`, `state`, `vncReady`, `vncPort?`     | control |
//! | `vnc_ready` | `sessionId`, `vncPort`, `podName?`               | tunnel  |
//! | `vnc_data`  | `sessionId`, `data` (base64)                     | tunnel  |
//! | `vnc_error` | `sessionId`, `error`                             | tunnel  |
//!
//! ## Hub → agent
//!
//! | Type        | Payload                                          |
//! |-------------|--------------------------------------------------|
//! | `command`   | `commandId`, `sessionId?`, `action`, `args`      |
//! | `ping`      | `timestamp`                                      |
//! | `shutdown`  | `reason?`                                        |
//! | `vnc_data`  | `sessionId`, `data` (base64)                     |
//! | `vnc_close` | `sessionId`, `reason?`                           |

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded agent → hub envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat(HeartbeatPayload),
    Ack(AckPayload),
    Complete(CompletePayload),
    Failed(FailedPayload),
    Status(StatusPayload),
    VncReady(VncReadyPayload),
    VncData(VncDataPayload),
    VncError(VncErrorPayload),
}

/// A hub → agent envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HubMessage {
    Command(CommandPayload),
    Ping(PingPayload),
    Shutdown(ShutdownPayload),
    VncData(VncDataPayload),
    VncClose(VncClosePayload),
}

/// Control-class frames, dispatched synchronously by the read pump.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Heartbeat(HeartbeatPayload),
    Ack(AckPayload),
    Complete(CompletePayload),
    Failed(FailedPayload),
    Status(StatusPayload),
}

/// Tunnel-class frames, pushed onto the agent's inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelFrame {
    Ready(VncReadyPayload),
    Data(VncDataPayload),
    Error(VncErrorPayload),
}

impl TunnelFrame {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Ready(p) => &p.session_id,
            Self::Data(p) => &p.session_id,
            Self::Error(p) => &p.session_id,
        }
    }
}

/// Result of classifying an [`AgentMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlFrame),
    Tunnel(TunnelFrame),
}

impl AgentMessage {
    /// Decode a text frame received from an agent.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn classify(self) -> Inbound {
        match self {
            Self::Heartbeat(p) => Inbound::Control(ControlFrame::Heartbeat(p)),
            Self::Ack(p) => Inbound::Control(ControlFrame::Ack(p)),
            Self::Complete(p) => Inbound::Control(ControlFrame::Complete(p)),
            Self::Failed(p) => Inbound::Control(ControlFrame::Failed(p)),
            Self::Status(p) => Inbound::Control(ControlFrame::Status(p)),
            Self::VncReady(p) => Inbound::Tunnel(TunnelFrame::Ready(p)),
            Self::VncData(p) => Inbound::Tunnel(TunnelFrame::Data(p)),
            Self::VncError(p) => Inbound::Tunnel(TunnelFrame::Error(p)),
        }
    }
}

impl HubMessage {
    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub status: String,
    #[serde(default)]
    pub active_sessions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<AgentCapacity>,
}

/// Resource limits an agent advertises in its heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapacity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub command_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    pub command_id: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub session_id: String,
    pub state: String,
    #[serde(default)]
    pub vnc_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub vnc_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

/// Framebuffer/input bytes for one session, base64-encoded in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncDataPayload {
    pub session_id: String,
    pub data: String,
}

impl VncDataPayload {
    pub fn from_bytes(session_id: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            session_id: session_id.into(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncErrorPayload {
    pub session_id: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncClosePayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
