//! Live sockets of one user, partitioned by role.
//!
//! `agent` and `cli` are single-valued: registering a newer connection of
//! either role displaces the older one, which is handed back to the caller so
//! the displacement can be handled as an explicit transition. Frontends are
//! multi-valued (one per browser tab).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use toolrelay_protocol::Role;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-socket outbound buffer.
pub const CONNECTION_BUFFER_SIZE: usize = 128;

pub type ConnectionId = u64;

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Frames written to a WebSocket by its send task
#[derive(Debug)]
pub enum OutboundMessage {
    /// Serialized JSON frame
    Text(String),
    /// Raw pong response
    Pong(Bytes),
}

/// A registered socket, as seen by the session that owns it
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub user_id: String,
    /// Unix milliseconds
    pub connected_at: u64,
    tx: mpsc::Sender<OutboundMessage>,
}

impl Connection {
    pub fn new(role: Role, user_id: String, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: next_connection_id(),
            role,
            user_id,
            connected_at: unix_millis(),
            tx,
        }
    }

    /// Serialize and queue a frame without waiting. Returns false when the
    /// frame was dropped (socket gone or its buffer full).
    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                error!(
                    component = "connection",
                    event = "connection.send.serialize_failed",
                    connection_id = self.id,
                    error = %e,
                    "Failed to serialize outbound frame"
                );
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        match self.tx.try_send(OutboundMessage::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    component = "connection",
                    event = "connection.send.buffer_full",
                    connection_id = self.id,
                    role = %self.role,
                    user_id = %self.user_id,
                    "Outbound buffer full, frame dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Sockets currently registered for one user
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    agent: Option<Connection>,
    cli: Option<Connection>,
    frontends: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. For single-valued roles the previous canonical
    /// connection, if any, is returned as displaced.
    pub fn register(&mut self, connection: Connection) -> Option<Connection> {
        match connection.role {
            Role::Agent => self.agent.replace(connection),
            Role::Cli => self.cli.replace(connection),
            Role::Frontend => {
                self.frontends.push(connection);
                None
            }
        }
    }

    /// Remove a connection. Returns it only when it was registered; a close
    /// from a displaced agent/cli socket returns `None`.
    pub fn unregister(&mut self, role: Role, id: ConnectionId) -> Option<Connection> {
        match role {
            Role::Agent => take_if_id(&mut self.agent, id),
            Role::Cli => take_if_id(&mut self.cli, id),
            Role::Frontend => {
                let index = self.frontends.iter().position(|c| c.id == id)?;
                Some(self.frontends.remove(index))
            }
        }
    }

    pub fn agent(&self) -> Option<&Connection> {
        self.agent.as_ref()
    }

    pub fn cli(&self) -> Option<&Connection> {
        self.cli.as_ref()
    }

    pub fn frontends(&self) -> &[Connection] {
        &self.frontends
    }

    pub fn frontend(&self, id: ConnectionId) -> Option<&Connection> {
        self.frontends.iter().find(|c| c.id == id)
    }

    /// Whether `id` is the registered connection for `role`.
    pub fn is_current(&self, role: Role, id: ConnectionId) -> bool {
        match role {
            Role::Agent => self.agent.as_ref().is_some_and(|c| c.id == id),
            Role::Cli => self.cli.as_ref().is_some_and(|c| c.id == id),
            Role::Frontend => self.frontend(id).is_some(),
        }
    }

    /// Send the same frame to every frontend. Returns how many accepted it.
    pub fn broadcast_to_frontends<T: Serialize>(&self, msg: &T) -> usize {
        let Ok(json) = serde_json::to_string(msg) else {
            return 0;
        };
        self.frontends
            .iter()
            .filter(|c| c.send_text(json.clone()))
            .count()
    }
}

fn take_if_id(slot: &mut Option<Connection>, id: ConnectionId) -> Option<Connection> {
    if slot.as_ref().is_some_and(|c| c.id == id) {
        slot.take()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(role: Role) -> (Connection, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (Connection::new(role, "user-a".to_string(), tx), rx)
    }

    #[test]
    fn newer_agent_displaces_older() {
        let mut registry = ConnectionRegistry::new();
        let (first, _rx1) = conn(Role::Agent);
        let (second, _rx2) = conn(Role::Agent);
        let first_id = first.id;
        let second_id = second.id;

        assert!(registry.register(first).is_none());
        let displaced = registry.register(second).expect("first agent displaced");
        assert_eq!(displaced.id, first_id);
        assert_eq!(registry.agent().map(|c| c.id), Some(second_id));
    }

    #[test]
    fn closing_displaced_socket_leaves_current_in_place() {
        let mut registry = ConnectionRegistry::new();
        let (old_cli, _rx1) = conn(Role::Cli);
        let (new_cli, _rx2) = conn(Role::Cli);
        let old_id = old_cli.id;
        let new_id = new_cli.id;
        registry.register(old_cli);
        registry.register(new_cli);

        assert!(registry.unregister(Role::Cli, old_id).is_none());
        assert!(registry.is_current(Role::Cli, new_id));
        assert!(registry.unregister(Role::Cli, new_id).is_some());
        assert!(registry.cli().is_none());
    }

    #[test]
    fn frontends_are_multi_valued() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rxa) = conn(Role::Frontend);
        let (b, _rxb) = conn(Role::Frontend);
        let a_id = a.id;
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.frontends().len(), 2);

        registry.unregister(Role::Frontend, a_id);
        assert_eq!(registry.frontends().len(), 1);
        assert!(registry.frontend(a_id).is_none());
    }

    #[test]
    fn broadcast_reaches_every_frontend() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut rxa) = conn(Role::Frontend);
        let (b, mut rxb) = conn(Role::Frontend);
        let (cli, mut rx_cli) = conn(Role::Cli);
        registry.register(a);
        registry.register(b);
        registry.register(cli);

        let sent = registry.broadcast_to_frontends(&serde_json::json!({"_tag": "ping"}));
        assert_eq!(sent, 2);
        assert!(matches!(rxa.try_recv(), Ok(OutboundMessage::Text(_))));
        assert!(matches!(rxb.try_recv(), Ok(OutboundMessage::Text(_))));
        assert!(rx_cli.try_recv().is_err());
    }

    #[test]
    fn send_reports_closed_socket() {
        let (connection, rx) = conn(Role::Frontend);
        drop(rx);
        assert!(!connection.send_text("{}".to_string()));
    }
}
