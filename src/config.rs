//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `AGENTHUB_LISTEN`, `AGENTHUB_AGENT_KEY`,
//!    `AGENTHUB_LOG`
//! 2. **Config file**: path via `--config <path>`, or `agenthub.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [logging]
//! level = "info"
//!
//! [auth]
//! agent_key = "shared-secret"      # optional, required as ?token= on /agents/connect
//! [auth.tokens]
//! "browser-token-1" = "alice"      # bearer token -> user id
//!
//! [hub]
//! outbound_queue = 256
//! inbound_queue = 256
//! read_timeout_secs = 60
//! write_timeout_secs = 10
//! # ping_interval_secs defaults to 9/10 of read_timeout_secs
//! heartbeat_timeout_secs = 90
//! sweep_interval_secs = 30
//! max_message_bytes = 524288
//! command_timeout_secs = 300
//!
//! [tunnel]
//! browser_queue = 256
//!
//! [[inventory.agents]]
//! agent_id = "k8s-prod-us-east-1"
//! platform = "kubernetes"
//!
//! [[inventory.sessions]]
//! session_id = "sess-1"
//! owner = "alice"
//! state = "running"
//! agent_id = "k8s-prod-us-east-1"
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Failure to read or parse the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Principal resolution and agent admission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Bearer token → user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    /// Shared secret agents present as `?token=`. `None` admits any known agent.
    #[serde(default)]
    pub agent_key: Option<String>,
}

/// Agent connection and pump tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound frame queue per agent (default 256).
    #[serde(default = "default_queue")]
    pub outbound_queue: usize,
    /// Inbound tunnel frame queue per agent (default 256).
    #[serde(default = "default_queue")]
    pub inbound_queue: usize,
    /// Read deadline; a silent connection is declared dead after this (default 60).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Per-write deadline (default 10).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Keepalive ping period. Defaults to 9/10 of `read_timeout_secs`.
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
    /// Agents silent for longer than this are swept (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Period of the stale-agent and command sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Largest accepted WebSocket message (default 512 KiB).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Non-terminal commands older than this leave the tracker buffer (default 300).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// Browser tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Frames buffered toward one browser before drops (default 256).
    #[serde(default = "default_queue")]
    pub browser_queue: usize,
}

/// Seed data for the in-memory store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
    #[serde(default)]
    pub sessions: Vec<SessionSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSeed {
    pub agent_id: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSeed {
    pub session_id: String,
    pub owner: String,
    #[serde(default = "default_session_state")]
    pub state: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_queue() -> usize {
    256
}
fn default_read_timeout() -> u64 {
    60
}
fn default_write_timeout() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_max_message_bytes() -> usize {
    512 * 1024
}
fn default_command_timeout() -> u64 {
    300
}
fn default_platform() -> String {
    "custom".to_string()
}
fn default_session_state() -> String {
    "running".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_queue(),
            inbound_queue: default_queue(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            ping_interval_secs: None,
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_message_bytes: default_max_message_bytes(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            browser_queue: default_queue(),
        }
    }
}

impl HubConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Explicit ping interval, or 9/10 of the read deadline.
    pub fn ping_interval(&self) -> Duration {
        match self.ping_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.read_timeout() * 9 / 10,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `agenthub.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("agenthub.toml").exists() => Self::from_file("agenthub.toml")?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("AGENTHUB_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("AGENTHUB_AGENT_KEY") {
            config.auth.agent_key = Some(key);
        }
        if let Ok(level) = std::env::var("AGENTHUB_LOG") {
            config.logging.level = level;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse TOML text; `origin` names the source in error messages.
    pub fn parse(origin: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }
}
