//! Commands sent to a user session actor from sockets, dispatchers and timers.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use toolrelay_protocol::{AgentInbound, AgentRequest, CliInbound, FrontendInbound, Role};

use crate::connection::{Connection, ConnectionId};
use crate::correlation::Generation;
use crate::error::DispatchError;
use crate::session::{FrontendRpcKey, Presence};

pub type DispatchReply = oneshot::Sender<Result<Value, DispatchError>>;

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    // -- Socket lifecycle --
    Connect {
        connection: Connection,
    },
    Disconnect {
        role: Role,
        connection_id: ConnectionId,
    },

    // -- Inbound frames, already parsed for the socket's role --
    FrontendMessage {
        connection_id: ConnectionId,
        message: FrontendInbound,
    },
    CliMessage {
        connection_id: ConnectionId,
        message: CliInbound,
    },
    AgentMessage {
        connection_id: ConnectionId,
        message: AgentInbound,
    },

    // -- In-process dispatch --
    /// Send a request to the agent and reply once it completes.
    DispatchToAgent {
        request: AgentRequest,
        timeout: Duration,
        reply: DispatchReply,
    },

    // -- Timers --
    ExpireAgentCall {
        call_id: String,
        generation: Generation,
    },
    ExpireFrontendRpc {
        key: FrontendRpcKey,
        generation: Generation,
    },

    // -- Queries --
    GetPresence {
        reply: oneshot::Sender<Presence>,
    },
}
