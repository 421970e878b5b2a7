//! Per-user session state and its command handlers.
//!
//! A `UserSession` is owned by exactly one actor task (see
//! `session_actor.rs`) and mutated only from `apply`, one command at a time.
//! Handlers never await: outbound frames go through non-blocking sends and
//! dispatch callers are completed through their oneshot replies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use toolrelay_protocol::agent::error_message;
use toolrelay_protocol::{
    AgentInbound, AgentRequest, CliInbound, CliOutbound, CliStatus, FrontendInbound,
    FrontendOutbound, Role, RpcErrorKind,
};

use crate::connection::{unix_millis, Connection, ConnectionId, ConnectionRegistry};
use crate::correlation::{Generation, PendingTable};
use crate::error::DispatchError;
use crate::session_command::{DispatchReply, SessionCommand};

/// Budget for a browser-originated RPC to be answered by the daemon.
pub const FRONTEND_RPC_TIMEOUT: Duration = Duration::from_secs(30);

const CLI_DISCONNECTED_MESSAGE: &str = "CLI disconnected";
const CLI_NOT_CONNECTED_MESSAGE: &str = "CLI not connected";
const REQUEST_ID_REUSED_MESSAGE: &str = "Request id reused by a newer call";

/// Key of a pending browser RPC: `userId:requestId`. Request ids are
/// generated by the browser and are only unique within one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrontendRpcKey(String);

impl FrontendRpcKey {
    pub fn new(user_id: &str, request_id: &str) -> Self {
        Self(format!("{user_id}:{request_id}"))
    }

    pub fn belongs_to(&self, user_id: &str) -> bool {
        self.0
            .strip_prefix(user_id)
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl fmt::Display for FrontendRpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Published view of a session, readable without going through the actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub agent_connected: bool,
    pub agent_connected_at: Option<u64>,
    pub cli_connected: bool,
    pub frontend_count: usize,
    pub pending_agent_calls: usize,
    pub pending_frontend_rpcs: usize,
}

impl Presence {
    pub fn is_idle(&self) -> bool {
        !self.agent_connected
            && !self.cli_connected
            && self.frontend_count == 0
            && self.pending_agent_calls == 0
            && self.pending_frontend_rpcs == 0
    }
}

struct PendingAgentCall {
    reply: DispatchReply,
    timeout: Duration,
}

struct PendingFrontendRpc {
    request_id: String,
    connection_id: ConnectionId,
}

pub struct UserSession {
    user_id: String,
    connections: ConnectionRegistry,
    pending_agent_calls: PendingTable<String, PendingAgentCall>,
    pending_frontend_rpcs: PendingTable<FrontendRpcKey, PendingFrontendRpc>,
    /// Where timers report expiries. Weak so the actor stops once every
    /// handle is gone.
    self_tx: mpsc::WeakSender<SessionCommand>,
    presence: Arc<ArcSwap<Presence>>,
}

impl UserSession {
    pub fn new(
        user_id: String,
        self_tx: mpsc::WeakSender<SessionCommand>,
        presence: Arc<ArcSwap<Presence>>,
    ) -> Self {
        Self {
            user_id,
            connections: ConnectionRegistry::new(),
            pending_agent_calls: PendingTable::new(),
            pending_frontend_rpcs: PendingTable::new(),
            self_tx,
            presence,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Process one command, then republish presence.
    pub fn apply(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect { connection } => self.accept_connection(connection),
            SessionCommand::Disconnect {
                role,
                connection_id,
            } => self.connection_closed(role, connection_id),
            SessionCommand::FrontendMessage {
                connection_id,
                message,
            } => self.handle_frontend_message(connection_id, message),
            SessionCommand::CliMessage {
                connection_id,
                message,
            } => self.handle_cli_message(connection_id, message),
            SessionCommand::AgentMessage {
                connection_id,
                message,
            } => self.handle_agent_message(connection_id, message),
            SessionCommand::DispatchToAgent {
                request,
                timeout,
                reply,
            } => self.dispatch_to_agent(request, timeout, reply),
            SessionCommand::ExpireAgentCall {
                call_id,
                generation,
            } => self.expire_agent_call(call_id, generation),
            SessionCommand::ExpireFrontendRpc { key, generation } => {
                self.expire_frontend_rpc(key, generation)
            }
            SessionCommand::GetPresence { reply } => {
                let _ = reply.send(self.current_presence());
                return;
            }
        }
        self.publish_presence();
    }

    fn current_presence(&self) -> Presence {
        Presence {
            agent_connected: self.connections.agent().is_some(),
            agent_connected_at: self.connections.agent().map(|c| c.connected_at),
            cli_connected: self.connections.cli().is_some(),
            frontend_count: self.connections.frontends().len(),
            pending_agent_calls: self.pending_agent_calls.len(),
            pending_frontend_rpcs: self.pending_frontend_rpcs.len(),
        }
    }

    fn publish_presence(&self) {
        let next = self.current_presence();
        if *self.presence.load_full() != next {
            self.presence.store(Arc::new(next));
        }
    }

    // -- Socket lifecycle --

    fn accept_connection(&mut self, connection: Connection) {
        let role = connection.role;
        let connection_id = connection.id;
        info!(
            component = "session",
            event = "session.connection.accepted",
            user_id = %self.user_id,
            role = %role,
            connection_id,
            "Connection registered"
        );

        match role {
            Role::Frontend => {
                connection.send_json(&FrontendOutbound::CliStatus {
                    status: CliStatus::from_connected(self.connections.cli().is_some()),
                    timestamp: unix_millis(),
                });
                self.connections.register(connection);
            }
            Role::Cli => {
                if let Some(displaced) = self.connections.register(connection) {
                    self.log_displaced(&displaced);
                    self.reject_frontend_rpcs(CLI_DISCONNECTED_MESSAGE);
                }
                self.broadcast_cli_status(CliStatus::Connected);
            }
            Role::Agent => {
                if let Some(displaced) = self.connections.register(connection) {
                    self.log_displaced(&displaced);
                    self.reject_agent_calls(DispatchError::AgentDisconnected);
                }
            }
        }
    }

    fn log_displaced(&self, displaced: &Connection) {
        info!(
            component = "session",
            event = "session.connection.displaced",
            user_id = %self.user_id,
            role = %displaced.role,
            connection_id = displaced.id,
            "Newer connection replaced this one; in-flight calls are rejected"
        );
    }

    fn connection_closed(&mut self, role: Role, connection_id: ConnectionId) {
        if self.connections.unregister(role, connection_id).is_none() {
            debug!(
                component = "session",
                event = "session.connection.stale_close",
                user_id = %self.user_id,
                role = %role,
                connection_id,
                "Close from a displaced connection ignored"
            );
            return;
        }

        info!(
            component = "session",
            event = "session.connection.closed",
            user_id = %self.user_id,
            role = %role,
            connection_id,
            "Connection unregistered"
        );

        match role {
            Role::Cli => {
                self.broadcast_cli_status(CliStatus::Disconnected);
                self.reject_frontend_rpcs(CLI_DISCONNECTED_MESSAGE);
            }
            Role::Agent => self.reject_agent_calls(DispatchError::AgentDisconnected),
            Role::Frontend => {
                let dropped = self
                    .pending_frontend_rpcs
                    .claim_where(|_, rpc| rpc.connection_id == connection_id);
                if !dropped.is_empty() {
                    debug!(
                        component = "session",
                        event = "session.rpc.owner_closed",
                        user_id = %self.user_id,
                        connection_id,
                        dropped = dropped.len(),
                        "Dropped pending RPCs of a closed frontend"
                    );
                }
            }
        }
    }

    fn broadcast_cli_status(&self, status: CliStatus) {
        self.connections
            .broadcast_to_frontends(&FrontendOutbound::CliStatus {
                status,
                timestamp: unix_millis(),
            });
    }

    fn reject_agent_calls(&mut self, error: DispatchError) {
        for (call_id, call) in self.pending_agent_calls.claim_all() {
            debug!(
                component = "session",
                event = "session.agent_call.rejected",
                user_id = %self.user_id,
                call_id = %call_id,
                error = %error,
            );
            let _ = call.reply.send(Err(error.clone()));
        }
    }

    fn reject_frontend_rpcs(&mut self, message: &str) {
        let user_id = &self.user_id;
        let rejected = self
            .pending_frontend_rpcs
            .claim_where(|key, _| key.belongs_to(user_id));

        for (_, rpc) in rejected {
            if let Some(frontend) = self.connections.frontend(rpc.connection_id) {
                frontend.send_json(&FrontendOutbound::RpcError {
                    request_id: rpc.request_id,
                    kind: RpcErrorKind::NoCliConnected,
                    message: message.to_string(),
                });
            }
        }
    }

    // -- Frontend channel --

    fn handle_frontend_message(&mut self, connection_id: ConnectionId, message: FrontendInbound) {
        let Some(frontend) = self.connections.frontend(connection_id).cloned() else {
            return;
        };

        match message {
            FrontendInbound::CliStatusRequest => {
                frontend.send_json(&FrontendOutbound::CliStatusResponse {
                    connected: self.connections.cli().is_some(),
                });
            }
            FrontendInbound::RpcCall {
                request_id,
                method,
                body,
            } => self.forward_rpc_call(&frontend, request_id, method, body),
            FrontendInbound::Unknown => {
                debug!(
                    component = "session",
                    event = "session.frontend.unknown_tag",
                    user_id = %self.user_id,
                    connection_id,
                    "Ignoring frontend message with unknown tag"
                );
            }
        }
    }

    fn forward_rpc_call(
        &mut self,
        frontend: &Connection,
        request_id: String,
        method: String,
        body: Map<String, Value>,
    ) {
        let Some(cli) = self.connections.cli().cloned() else {
            frontend.send_json(&FrontendOutbound::RpcError {
                request_id,
                kind: RpcErrorKind::NoCliConnected,
                message: CLI_NOT_CONNECTED_MESSAGE.to_string(),
            });
            return;
        };

        let key = FrontendRpcKey::new(&self.user_id, &request_id);
        if let Some(earlier) = self.pending_frontend_rpcs.claim(&key) {
            warn!(
                component = "session",
                event = "session.rpc.duplicate_request_id",
                user_id = %self.user_id,
                request_id = %request_id,
                earlier_connection_id = earlier.connection_id,
                "Request id reused while pending; earlier call abandoned"
            );
            if let Some(owner) = self.connections.frontend(earlier.connection_id) {
                owner.send_json(&FrontendOutbound::RpcError {
                    request_id: earlier.request_id,
                    kind: RpcErrorKind::Superseded,
                    message: REQUEST_ID_REUSED_MESSAGE.to_string(),
                });
            }
        }

        let expiry_key = key.clone();
        self.pending_frontend_rpcs.insert(
            key.clone(),
            PendingFrontendRpc {
                request_id: request_id.clone(),
                connection_id: frontend.id,
            },
            FRONTEND_RPC_TIMEOUT,
            &self.self_tx,
            move |generation| SessionCommand::ExpireFrontendRpc {
                key: expiry_key,
                generation,
            },
        );

        debug!(
            component = "session",
            event = "session.rpc.forwarded",
            user_id = %self.user_id,
            request_id = %request_id,
            method = %method,
        );

        let forwarded = cli.send_json(&CliOutbound::RpcCall {
            request_id: request_id.clone(),
            method,
            body,
        });
        if !forwarded && self.pending_frontend_rpcs.claim(&key).is_some() {
            frontend.send_json(&FrontendOutbound::RpcError {
                request_id,
                kind: RpcErrorKind::NoCliConnected,
                message: CLI_NOT_CONNECTED_MESSAGE.to_string(),
            });
        }
    }

    fn expire_frontend_rpc(&mut self, key: FrontendRpcKey, generation: Generation) {
        let Some(rpc) = self.pending_frontend_rpcs.claim_expired(&key, generation) else {
            return;
        };
        warn!(
            component = "session",
            event = "session.rpc.timeout",
            user_id = %self.user_id,
            request_id = %rpc.request_id,
            "Daemon did not answer RPC in time"
        );
        if let Some(frontend) = self.connections.frontend(rpc.connection_id) {
            frontend.send_json(&FrontendOutbound::RpcError {
                request_id: rpc.request_id,
                kind: RpcErrorKind::Timeout,
                message: format!(
                    "RPC timed out after {}s",
                    FRONTEND_RPC_TIMEOUT.as_secs()
                ),
            });
        }
    }

    // -- Cli channel --

    fn handle_cli_message(&mut self, connection_id: ConnectionId, message: CliInbound) {
        if !self.connections.is_current(Role::Cli, connection_id) {
            debug!(
                component = "session",
                event = "session.cli.stale_frame",
                user_id = %self.user_id,
                connection_id,
                "Frame from a displaced cli connection ignored"
            );
            return;
        }

        match message {
            CliInbound::RpcResult { request_id, body } => {
                let key = FrontendRpcKey::new(&self.user_id, &request_id);
                let Some(rpc) = self.pending_frontend_rpcs.claim(&key) else {
                    debug!(
                        component = "session",
                        event = "session.rpc.unmatched_result",
                        user_id = %self.user_id,
                        request_id = %request_id,
                        "Late or duplicate rpc_result dropped"
                    );
                    return;
                };
                if let Some(frontend) = self.connections.frontend(rpc.connection_id) {
                    frontend.send_json(&FrontendOutbound::RpcResult { request_id, body });
                }
            }
            CliInbound::Unknown => {}
        }
    }

    // -- Agent channel --

    fn dispatch_to_agent(&mut self, request: AgentRequest, timeout: Duration, reply: DispatchReply) {
        let Some(agent) = self.connections.agent().cloned() else {
            let _ = reply.send(Err(DispatchError::NoAgentConnected));
            return;
        };

        let call_id = request.id().to_string();
        if self.pending_agent_calls.contains_key(&call_id) {
            let _ = reply.send(Err(DispatchError::DuplicateCallId(call_id)));
            return;
        }

        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                let _ = reply.send(Err(DispatchError::Encode(e.to_string())));
                return;
            }
        };

        if !agent.send_text(json) {
            let _ = reply.send(Err(DispatchError::AgentDisconnected));
            return;
        }

        debug!(
            component = "session",
            event = "session.agent_call.dispatched",
            user_id = %self.user_id,
            call_id = %call_id,
            name = %request.name(),
            timeout_ms = timeout.as_millis() as u64,
        );

        let expiry_id = call_id.clone();
        self.pending_agent_calls.insert(
            call_id,
            PendingAgentCall { reply, timeout },
            timeout,
            &self.self_tx,
            move |generation| SessionCommand::ExpireAgentCall {
                call_id: expiry_id,
                generation,
            },
        );
    }

    fn expire_agent_call(&mut self, call_id: String, generation: Generation) {
        let Some(call) = self.pending_agent_calls.claim_expired(&call_id, generation) else {
            return;
        };
        warn!(
            component = "session",
            event = "session.agent_call.timeout",
            user_id = %self.user_id,
            call_id = %call_id,
            timeout_ms = call.timeout.as_millis() as u64,
            "Agent did not answer in time"
        );
        let _ = call.reply.send(Err(DispatchError::Timeout(call.timeout)));
    }

    fn handle_agent_message(&mut self, connection_id: ConnectionId, message: AgentInbound) {
        if !self.connections.is_current(Role::Agent, connection_id) {
            debug!(
                component = "session",
                event = "session.agent.stale_frame",
                user_id = %self.user_id,
                connection_id,
                "Frame from a displaced agent connection ignored"
            );
            return;
        }

        let AgentInbound::ToolResult {
            call_id,
            id,
            result,
            error,
        } = message
        else {
            return;
        };

        let call_id = match (call_id, id) {
            (Some(call_id), _) => call_id,
            (None, Some(id)) => {
                debug!(
                    component = "session",
                    event = "session.agent.legacy_id_field",
                    user_id = %self.user_id,
                    call_id = %id,
                    "tool_result correlated through legacy `id` field"
                );
                id
            }
            (None, None) => {
                debug!(
                    component = "session",
                    event = "session.agent.result_without_id",
                    user_id = %self.user_id,
                    "tool_result without callId dropped"
                );
                return;
            }
        };

        let Some(call) = self.pending_agent_calls.claim(&call_id) else {
            debug!(
                component = "session",
                event = "session.agent_call.unmatched_result",
                user_id = %self.user_id,
                call_id = %call_id,
                "Late or duplicate tool_result dropped"
            );
            return;
        };

        let outcome = match error {
            Some(error) => Err(DispatchError::Remote(error_message(&error))),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = call.reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_key_is_namespaced_by_user() {
        let key = FrontendRpcKey::new("user-a", "r1");
        assert_eq!(key.to_string(), "user-a:r1");
        assert!(key.belongs_to("user-a"));
        assert!(!key.belongs_to("user"));
        assert!(!key.belongs_to("user-b"));
    }

    #[test]
    fn idle_presence_has_no_sockets_and_no_pending_calls() {
        assert!(Presence::default().is_idle());
        assert!(!Presence {
            frontend_count: 1,
            ..Default::default()
        }
        .is_idle());
        assert!(!Presence {
            pending_agent_calls: 1,
            ..Default::default()
        }
        .is_idle());
    }
}
