//! Failure taxonomy for correlated calls into a user's session.

use std::time::Duration;

use thiserror::Error;

/// Terminal failure of a dispatch to the agent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no agent connected")]
    NoAgentConnected,

    #[error("agent disconnected while the call was in flight")]
    AgentDisconnected,

    #[error("agent did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("agent reported an error: {0}")]
    Remote(String),

    #[error("call id {0} is already pending")]
    DuplicateCallId(String),

    #[error("session is no longer running")]
    SessionClosed,

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl DispatchError {
    /// Stable machine-readable code, used in HTTP bodies and stream chunks.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NoAgentConnected => "no_agent_connected",
            DispatchError::AgentDisconnected => "agent_disconnected",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Remote(_) => "agent_error",
            DispatchError::DuplicateCallId(_) => "duplicate_call_id",
            DispatchError::SessionClosed => "session_closed",
            DispatchError::Encode(_) => "encode_error",
        }
    }

    /// Whether the agent is gone, so further dispatches in the same turn
    /// are pointless.
    pub fn is_agent_unavailable(&self) -> bool {
        matches!(
            self,
            DispatchError::NoAgentConnected
                | DispatchError::AgentDisconnected
                | DispatchError::SessionClosed
        )
    }
}
