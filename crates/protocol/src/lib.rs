//! toolrelay protocol
//!
//! Shared types for the three socket channels a user session multiplexes
//! (local agent, local daemon, browser tabs) and for the SSE chunks streamed
//! by the agent proxy. Everything is JSON, one object per WebSocket frame.

use uuid::Uuid;

pub mod agent;
pub mod cli;
pub mod frontend;
pub mod stream;
pub mod types;

pub use agent::{AgentInbound, AgentRequest};
pub use cli::{CliInbound, CliOutbound};
pub use frontend::{FrontendInbound, FrontendOutbound};
pub use stream::StreamChunk;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
