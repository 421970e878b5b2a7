//! `POST /api/v1/undo`: roll a chat back to its latest snapshot.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::auth::AuthUser;
use crate::dispatch::{self, ApiError, SNAPSHOT_RESTORE, SNAPSHOT_RESTORE_TIMEOUT};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRequest {
    pub chat_id: String,
    /// Drop the snapshot and messages without touching the filesystem.
    #[serde(default)]
    pub delete_only: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UndoResponse {
    pub restored_hash: String,
    pub message_count: usize,
    pub files_restored: bool,
}

pub async fn undo_handler(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    body: Result<Json<UndoRequest>, JsonRejection>,
) -> Result<Json<UndoResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let chat = state
        .chats
        .chat_for_user(&body.chat_id, &user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("chat {} not found", body.chat_id)))?;

    let snapshot = state
        .chats
        .latest_snapshot(&chat.id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("no snapshot to undo to".into()))?;

    // Files first: if the restore fails, the chat history stays intact.
    if !body.delete_only {
        dispatch::agent_rpc(
            &state.sessions,
            &user_id,
            SNAPSHOT_RESTORE,
            json!({
                "chatId": chat.id,
                "projectId": chat.project_id,
                "projectCwd": chat.project_cwd,
                "hash": snapshot.hash,
            }),
            SNAPSHOT_RESTORE_TIMEOUT,
        )
        .await?;
    }

    state
        .chats
        .truncate_messages(&chat.id, snapshot.message_count)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .chats
        .delete_snapshot(&chat.id, &snapshot.hash)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(
        component = "undo",
        event = "undo.applied",
        user_id = %user_id,
        chat_id = %chat.id,
        hash = %snapshot.hash,
        message_count = snapshot.message_count,
        files_restored = !body.delete_only,
    );

    Ok(Json(UndoResponse {
        restored_hash: snapshot.hash,
        message_count: snapshot.message_count,
        files_restored: !body.delete_only,
    }))
}
