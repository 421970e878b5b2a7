//! Application state

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::agent_turn::ModelClient;
use crate::auth::Authenticator;
use crate::chat_store::ChatStore;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::session::Presence;
use crate::session_actor::UserSessionHandle;
use crate::stream_store::StreamStore;

/// User id → session actor. Sessions spawn lazily on first use.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, UserSessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to `user_id`'s session, spawning it if needed.
    pub fn session(&self, user_id: &str) -> UserSessionHandle {
        if let Some(handle) = self.sessions.get(user_id) {
            return handle.clone();
        }
        self.sessions
            .entry(user_id.to_string())
            .or_insert_with(|| UserSessionHandle::spawn(user_id.to_string()))
            .clone()
    }

    /// Handle to an already running session.
    pub fn existing(&self, user_id: &str) -> Option<UserSessionHandle> {
        self.sessions.get(user_id).map(|h| h.clone())
    }

    pub fn presence(&self, user_id: &str) -> Presence {
        self.existing(user_id)
            .map(|h| h.presence().as_ref().clone())
            .unwrap_or_default()
    }

    pub fn is_agent_connected(&self, user_id: &str) -> bool {
        self.sessions
            .get(user_id)
            .is_some_and(|h| h.is_agent_connected())
    }

    /// Drop sessions that have no sockets, no pending calls and no outside
    /// holders. Their actors stop once the last handle is gone; a later
    /// connection simply spawns a fresh one.
    pub fn reap_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, handle| handle.is_shared() || !handle.presence().is_idle());
        let reaped = before.saturating_sub(self.sessions.len());
        if reaped > 0 {
            debug!(
                component = "state",
                event = "sessions.reaped",
                reaped,
                remaining = self.sessions.len(),
            );
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub auth: Arc<Authenticator>,
    pub chats: Arc<dyn ChatStore>,
    pub streams: Arc<StreamStore>,
    pub model: Arc<dyn ModelClient>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<ServerConfig>,
}
