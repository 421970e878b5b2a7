//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role a socket plays within a user's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Local process that executes coding tools.
    Agent,
    /// Local daemon answering lightweight RPCs.
    Cli,
    /// Browser tab.
    Frontend,
}

impl Role {
    /// Role requested through the `type` query parameter of the user stream
    /// endpoint. Only `cli` and `frontend` may be chosen there; anything else
    /// (including `agent`) falls back to `frontend`.
    pub fn from_user_stream_param(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("cli") => Role::Cli,
            _ => Role::Frontend,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Cli => "cli",
            Role::Frontend => "frontend",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daemon presence pushed to browser tabs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliStatus {
    Connected,
    Disconnected,
}

impl CliStatus {
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            CliStatus::Connected
        } else {
            CliStatus::Disconnected
        }
    }
}

/// Failure kinds reported to a browser tab for a proxied RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    NoCliConnected,
    Timeout,
    /// Another call from the same user reused this request id.
    Superseded,
}
