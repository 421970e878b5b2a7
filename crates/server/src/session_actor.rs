//! Session actor: owns a UserSession and processes commands sequentially.
//!
//! Each user's session runs as an independent tokio task. External callers
//! communicate via `UserSessionHandle` which sends `SessionCommand`
//! messages over an mpsc channel. Lock-free presence reads go through
//! `ArcSwap`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use toolrelay_protocol::AgentRequest;

use crate::error::DispatchError;
use crate::session::{Presence, UserSession};
use crate::session_command::SessionCommand;

const COMMAND_BUFFER_SIZE: usize = 256;

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct UserSessionHandle {
    pub user_id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    presence: Arc<ArcSwap<Presence>>,
}

impl UserSessionHandle {
    /// Spawn the actor for `user_id`, returning a handle.
    pub fn spawn(user_id: String) -> UserSessionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let presence = Arc::new(ArcSwap::from_pointee(Presence::default()));
        let session = UserSession::new(user_id.clone(), command_tx.downgrade(), presence.clone());

        tokio::spawn(session_actor_loop(session, command_rx));

        UserSessionHandle {
            user_id,
            command_tx,
            presence,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                user_id = %self.user_id,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Send `request` to the user's agent and wait for the matching
    /// `tool_result`, a timeout, or loss of the agent.
    ///
    /// Fails without waiting when no agent is connected.
    pub async fn dispatch(
        &self,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::DispatchToAgent {
                request,
                timeout,
                reply,
            })
            .await
            .map_err(|_| DispatchError::SessionClosed)?;
        rx.await.unwrap_or(Err(DispatchError::SessionClosed))
    }

    /// Lock-free presence read. May trail commands still queued on the actor.
    pub fn presence(&self) -> Arc<Presence> {
        self.presence.load_full()
    }

    /// Lightweight probe used before expensive work.
    pub fn is_agent_connected(&self) -> bool {
        self.presence.load().agent_connected
    }

    /// Presence as of every command queued before this call.
    pub async fn current_presence(&self) -> Option<Presence> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::GetPresence { reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Whether anything besides the registry and the actor itself holds
    /// this session.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.presence) > 2
    }
}

async fn session_actor_loop(
    mut session: UserSession,
    mut command_rx: mpsc::Receiver<SessionCommand>,
) {
    while let Some(cmd) = command_rx.recv().await {
        session.apply(cmd);
    }
    debug!(
        component = "session_actor",
        user_id = %session.user_id(),
        "Session actor stopped"
    );
}
