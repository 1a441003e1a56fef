#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! agenthub library: agent connection hub and per-session tunnels.
//!
//! - `hub`: agent registry, connection state, read/write pumps
//! - `protocol`: JSON envelope codec for the agent wire
//! - `commands`: command dispatch and lifecycle tracking
//! - `tunnel`: session id → browser route demultiplexer
//! - `control`: inbound control dispatch (heartbeat, replies, status)
//! - `store`: collaborator store traits and in-memory implementation
//! - `routes`: HTTP/WebSocket handlers
//! - `auth`: principal resolution middleware
//! - `config`: configuration loading

pub mod auth;
pub mod commands;
pub mod config;
pub mod control;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use commands::{Command, CommandStatus, CommandTracker};
pub use config::Config;
pub use error::HubError;
pub use hub::AgentHub;
pub use routes::router;
pub use state::AppState;
pub use store::{MemoryStore, Stores};
pub use tunnel::{CloseReason, TunnelRouter};
