//! `POST /api/v1/agent-proxy`: run one model turn for a chat and stream it.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use toolrelay_protocol::StreamChunk;

use crate::agent_turn::{run_turn, TurnContext};
use crate::auth::AuthUser;
use crate::chat_store::{Chat, ChatMessage};
use crate::dispatch::{self, ApiError, SNAPSHOT_CREATE, SNAPSHOT_CREATE_TIMEOUT};
use crate::state::AppState;
use crate::stream_store::StreamRecord;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProxyRequest {
    pub chat_id: String,
    pub model: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub execute_plan: bool,
    #[serde(default)]
    pub plan_name: Option<String>,
}

impl AgentProxyRequest {
    /// The user message to persist and send to the model.
    fn prompt(&self) -> Result<String, ApiError> {
        if self.chat_id.trim().is_empty() {
            return Err(ApiError::BadRequest("chatId is required".into()));
        }
        if self.model.trim().is_empty() {
            return Err(ApiError::BadRequest("model is required".into()));
        }
        if self.execute_plan {
            let plan = self
                .plan_name
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ApiError::BadRequest("planName is required to execute a plan".into()))?;
            return Ok(if self.message.trim().is_empty() {
                format!("Execute the plan \"{plan}\".")
            } else {
                format!("Execute the plan \"{plan}\". {}", self.message.trim())
            });
        }
        if self.message.trim().is_empty() {
            return Err(ApiError::BadRequest("message is required".into()));
        }
        Ok(self.message.clone())
    }
}

/// SSE response over a stream record: buffered chunks first, then live.
pub fn sse_response(record: &StreamRecord) -> Response {
    let events = record
        .attach()
        .map(|data| Ok::<_, Infallible>(Event::default().data(&*data)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

pub async fn agent_proxy_handler(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    body: Result<Json<AgentProxyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let prompt = body.prompt()?;

    let chat = state
        .chats
        .chat_for_user(&body.chat_id, &user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("chat {} not found", body.chat_id)))?;

    dispatch::require_agent(&state.sessions, &user_id)?;

    // Only turns that can actually start count against the window.
    state
        .limiter
        .check(&user_id)
        .map_err(|wait| ApiError::RateLimited {
            retry_after_secs: wait.as_secs().max(1),
        })?;

    let message_count = state
        .chats
        .append_message(&chat.id, ChatMessage::user(prompt))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let messages = state
        .chats
        .messages(&chat.id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let record = state.streams.begin(&chat.id);
    record.push(&StreamChunk::Start {
        stream_id: record.stream_id().to_string(),
        chat_id: chat.id.clone(),
    });
    info!(
        component = "agent_proxy",
        event = "turn.started",
        user_id = %user_id,
        chat_id = %chat.id,
        stream_id = %record.stream_id(),
        model = %body.model,
    );

    let response = sse_response(&record);
    let ctx = TurnContext {
        session: state.sessions.session(&user_id),
        chat,
        model: body.model,
        plan_mode: body.plan_mode,
        tool_timeout: state.config.tool_timeout,
        max_steps: state.config.max_turn_steps,
    };
    // Undo rewinds to the state before this user message.
    let snapshot_at = message_count.saturating_sub(1);
    tokio::spawn(drive_turn(state, ctx, messages, record, snapshot_at));

    Ok(response)
}

/// Snapshot the project, run the turn, persist the reply. Runs detached so
/// a client disconnect does not cancel it; the stream record stays
/// attachable.
async fn drive_turn(
    state: AppState,
    ctx: TurnContext,
    messages: Vec<ChatMessage>,
    record: Arc<StreamRecord>,
    snapshot_at: usize,
) {
    let user_id = ctx.session.user_id.clone();
    let chat = ctx.chat.clone();
    create_snapshot(&state, &user_id, &chat, snapshot_at).await;

    let outcome = run_turn(ctx, state.model.clone(), messages, record).await;
    if !outcome.text.is_empty() {
        if let Err(e) = state
            .chats
            .append_message(&chat.id, ChatMessage::assistant(outcome.text))
            .await
        {
            warn!(
                component = "agent_proxy",
                event = "turn.persist_failed",
                chat_id = %chat.id,
                error = %e,
            );
        }
    }
    info!(
        component = "agent_proxy",
        event = "turn.finished",
        user_id = %user_id,
        chat_id = %chat.id,
        tool_calls = outcome.tool_calls,
        aborted = outcome.aborted,
    );
}

/// Best effort: failures are logged and the turn goes ahead.
async fn create_snapshot(state: &AppState, user_id: &str, chat: &Chat, message_count: usize) {
    let args = json!({
        "chatId": chat.id,
        "projectId": chat.project_id,
        "projectCwd": chat.project_cwd,
    });
    let result = dispatch::agent_rpc(
        &state.sessions,
        user_id,
        SNAPSHOT_CREATE,
        args,
        SNAPSHOT_CREATE_TIMEOUT,
    )
    .await;

    let hash = match result {
        Ok(value) => snapshot_hash(&value),
        Err(e) => {
            warn!(
                component = "agent_proxy",
                event = "snapshot.create_failed",
                user_id = %user_id,
                chat_id = %chat.id,
                error = %e,
            );
            return;
        }
    };
    let Some(hash) = hash else {
        warn!(
            component = "agent_proxy",
            event = "snapshot.missing_hash",
            chat_id = %chat.id,
        );
        return;
    };
    if let Err(e) = state.chats.add_snapshot(&chat.id, &hash, message_count).await {
        warn!(
            component = "agent_proxy",
            event = "snapshot.persist_failed",
            chat_id = %chat.id,
            error = %e,
        );
    }
}

/// Daemons answer with either `{hash}` or a bare hash string.
fn snapshot_hash(value: &Value) -> Option<String> {
    value
        .get("hash")
        .and_then(Value::as_str)
        .or_else(|| value.as_str())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}
