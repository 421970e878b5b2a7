//! HTTP routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::agent_proxy::{agent_proxy_handler, sse_response};
use crate::auth::AuthUser;
use crate::dispatch::{self, ApiError};
use crate::state::AppState;
use crate::undo::undo_handler;
use crate::websocket::{agent_stream_handler, user_stream_handler};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agent-streams", get(agent_stream_handler))
        .route("/api/v1/user-streams", get(user_stream_handler))
        .route("/api/v1/agent-status", get(agent_status_handler))
        .route("/api/v1/chats", post(create_chat_handler))
        .route("/api/v1/chats/{chat_id}/stream", get(reattach_stream_handler))
        .route("/api/v1/agent-proxy", post(agent_proxy_handler))
        .route("/api/v1/agent-rpc", post(agent_rpc_handler))
        .route("/api/v1/undo", post(undo_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatusResponse {
    agent_connected: bool,
    cli_connected: bool,
    agent_connected_at: Option<u64>,
}

async fn agent_status_handler(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
) -> Json<AgentStatusResponse> {
    let presence = state.sessions.presence(&user_id);
    Json(AgentStatusResponse {
        agent_connected: presence.agent_connected,
        cli_connected: presence.cli_connected,
        agent_connected_at: presence.agent_connected_at,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatRequest {
    project_id: String,
    project_cwd: String,
}

async fn create_chat_handler(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    body: Result<Json<CreateChatRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if body.project_id.trim().is_empty() || body.project_cwd.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "projectId and projectCwd are required".into(),
        ));
    }
    let chat = state
        .chats
        .create_chat(&user_id, &body.project_id, &body.project_cwd)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "chatId": chat.id })))
}

async fn reattach_stream_handler(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .chats
        .chat_for_user(&chat_id, &user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("chat {chat_id} not found")))?;

    Ok(match state.streams.get(&chat_id) {
        Some(record) => {
            debug!(
                component = "router",
                event = "stream.reattach",
                chat_id = %chat_id,
                stream_id = %record.stream_id(),
                completed = record.is_completed(),
            );
            sse_response(&record)
        }
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Debug, Deserialize)]
struct AgentRpcRequest {
    method: String,
    #[serde(default)]
    args: Value,
}

/// One-shot daemon RPC. Only `daemon:` and `codex:` methods are exposed.
async fn agent_rpc_handler(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    body: Result<Json<AgentRpcRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if !(body.method.starts_with("daemon:") || body.method.starts_with("codex:")) {
        return Err(ApiError::BadRequest(format!(
            "method {} is not allowed",
            body.method
        )));
    }
    let timeout = dispatch::rpc_timeout(&body.method);
    let result =
        dispatch::agent_rpc(&state.sessions, &user_id, &body.method, body.args, timeout).await?;
    Ok(Json(json!({ "result": result })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use toolrelay_protocol::{AgentInbound, AgentRequest, Role};

    use crate::connection::{Connection, OutboundMessage};
    use crate::rate_limit::RateLimiter;
    use crate::session_command::SessionCommand;
    use crate::state::test_support::test_app_state;

    fn bearer(state: &AppState, user: &str) -> String {
        format!(
            "Bearer {}",
            state.auth.issue_gateway_token(user, false, 3600).unwrap()
        )
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn post_json(state: &AppState, user: &str, uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::AUTHORIZATION, bearer(state, user))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(state: &AppState, user: &str, uri: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::AUTHORIZATION, bearer(state, user))
            .body(Body::empty())
            .unwrap()
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    async fn create_chat(state: &AppState, user: &str) -> String {
        let (status, body) = call(
            state,
            post_json(
                state,
                user,
                "/api/v1/chats",
                json!({"projectId": "p1", "projectCwd": "/work/p1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        json_body(&body)["chatId"].as_str().unwrap().to_string()
    }

    /// In-process agent that answers snapshot RPCs and tool calls, and
    /// records every request it sees.
    async fn connect_fake_agent(state: &AppState, user: &str) -> mpsc::UnboundedReceiver<AgentRequest> {
        let session = state.sessions.session(user);
        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(32);
        let agent = Connection::new(Role::Agent, user.to_string(), tx);
        let connection_id = agent.id;
        session.send(SessionCommand::Connect { connection: agent }).await;
        session.current_presence().await.unwrap();

        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(OutboundMessage::Text(text)) = rx.recv().await {
                let request: AgentRequest = serde_json::from_str(&text).unwrap();
                let result = match &request {
                    AgentRequest::RpcCall { method, .. } if method == "daemon:snapshot_create" => {
                        json!({"hash": "h1"})
                    }
                    AgentRequest::RpcCall { method, .. } => json!({"method": method}),
                    AgentRequest::ToolCall { tool, .. } => json!({"content": format!("{tool} ok")}),
                };
                let call_id = request.id().to_string();
                let _ = seen_tx.send(request);
                session
                    .send(SessionCommand::AgentMessage {
                        connection_id,
                        message: AgentInbound::ToolResult {
                            call_id: Some(call_id),
                            id: None,
                            result: Some(result),
                            error: None,
                        },
                    })
                    .await;
            }
        });
        seen_rx
    }

    fn sse_types(body: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(body)
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| {
                let value: Value = serde_json::from_str(data).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let state = test_app_state();
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn api_rejects_missing_token() {
        let state = test_app_state();
        let request = Request::get("/api/v1/agent-status")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(&body)["error"], "unauthorized");
    }

    #[tokio::test]
    async fn agent_status_reflects_presence() {
        let state = test_app_state();
        let (status, body) = call(&state, get(&state, "u1", "/api/v1/agent-status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json_body(&body),
            json!({"agentConnected": false, "cliConnected": false, "agentConnectedAt": null})
        );

        let _agent = connect_fake_agent(&state, "u1").await;
        let (_, body) = call(&state, get(&state, "u1", "/api/v1/agent-status")).await;
        let body = json_body(&body);
        assert_eq!(body["agentConnected"], true);
        assert!(body["agentConnectedAt"].is_u64());
    }

    #[tokio::test]
    async fn agent_proxy_rejections() {
        let state = test_app_state();
        let chat_id = create_chat(&state, "u1").await;

        let (status, _) = call(
            &state,
            post_json(&state, "u1", "/api/v1/agent-proxy", json!({"chatId": chat_id, "model": "echo"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            post_json(
                &state,
                "u2",
                "/api/v1/agent-proxy",
                json!({"chatId": chat_id, "model": "echo", "message": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &state,
            post_json(
                &state,
                "u1",
                "/api/v1/agent-proxy",
                json!({"chatId": chat_id, "model": "echo", "message": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&body)["error"], "no_agent_connected");
        // Nothing persisted for a turn that never started.
        assert!(state.chats.messages(&chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_proxy_rate_limit_counts_only_started_turns() {
        let mut state = test_app_state();
        state.limiter = Arc::new(RateLimiter::per_minute(2));
        let chat_id = create_chat(&state, "u1").await;
        let body = json!({"chatId": chat_id, "model": "echo", "message": "hi"});

        for _ in 0..3 {
            let (status, _) = call(&state, post_json(&state, "u1", "/api/v1/agent-proxy", body.clone())).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        }

        let _agent = connect_fake_agent(&state, "u1").await;
        for _ in 0..2 {
            let (status, _) = call(&state, post_json(&state, "u1", "/api/v1/agent-proxy", body.clone())).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) =
            call(&state, post_json(&state, "u1", "/api/v1/agent-proxy", body)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(&body)["error"], "rate_limited");
    }

    #[tokio::test]
    async fn agent_proxy_turn_then_undo() {
        let state = test_app_state();
        let chat_id = create_chat(&state, "u1").await;
        let mut seen = connect_fake_agent(&state, "u1").await;

        let (status, body) = call(
            &state,
            post_json(
                &state,
                "u1",
                "/api/v1/agent-proxy",
                json!({"chatId": chat_id, "model": "echo", "message": "!read_file {\"path\":\"a.rs\"}"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            sse_types(&body),
            vec!["start", "tool_call", "tool_result", "text", "done"]
        );

        match seen.recv().await.unwrap() {
            AgentRequest::RpcCall { method, .. } => assert_eq!(method, "daemon:snapshot_create"),
            other => panic!("expected snapshot first, got {other:?}"),
        }
        match seen.recv().await.unwrap() {
            AgentRequest::ToolCall {
                tool, project_cwd, ..
            } => {
                assert_eq!(tool, "read_file");
                assert_eq!(project_cwd.as_deref(), Some("/work/p1"));
            }
            other => panic!("expected tool call, got {other:?}"),
        }

        // The assistant reply is persisted right after the stream completes.
        let mut messages = state.chats.messages(&chat_id).await.unwrap();
        while messages.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            messages = state.chats.messages(&chat_id).await.unwrap();
        }

        // Reattaching to a finished stream replays it.
        let (status, body) = call(
            &state,
            get(&state, "u1", &format!("/api/v1/chats/{chat_id}/stream")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sse_types(&body).last().map(String::as_str), Some("done"));

        let (status, body) = call(
            &state,
            post_json(&state, "u1", "/api/v1/undo", json!({"chatId": chat_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json_body(&body),
            json!({"restoredHash": "h1", "messageCount": 0, "filesRestored": true})
        );
        match seen.recv().await.unwrap() {
            AgentRequest::RpcCall { method, args, .. } => {
                assert_eq!(method, "daemon:snapshot_restore");
                assert_eq!(args["hash"], "h1");
            }
            other => panic!("expected restore, got {other:?}"),
        }
        assert!(state.chats.messages(&chat_id).await.unwrap().is_empty());

        let (status, _) = call(
            &state,
            post_json(&state, "u1", "/api/v1/undo", json!({"chatId": chat_id})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn undo_delete_only_skips_restore() {
        let state = test_app_state();
        let chat_id = create_chat(&state, "u1").await;
        state
            .chats
            .append_message(&chat_id, crate::chat_store::ChatMessage::user("one"))
            .await
            .unwrap();
        state.chats.add_snapshot(&chat_id, "h0", 0).await.unwrap();

        // No agent connected: delete-only must still succeed.
        let (status, body) = call(
            &state,
            post_json(
                &state,
                "u1",
                "/api/v1/undo",
                json!({"chatId": chat_id, "deleteOnly": true}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["filesRestored"], false);
        assert!(state.chats.messages(&chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_rpc_checks_method_prefix() {
        let state = test_app_state();
        let (status, _) = call(
            &state,
            post_json(&state, "u1", "/api/v1/agent-rpc", json!({"method": "rm_rf", "args": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            post_json(&state, "u1", "/api/v1/agent-rpc", json!({"method": "codex:auth", "args": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let _agent = connect_fake_agent(&state, "u1").await;
        let (status, body) = call(
            &state,
            post_json(&state, "u1", "/api/v1/agent-rpc", json!({"method": "codex:auth", "args": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["result"]["method"], "codex:auth");
    }

    #[tokio::test]
    async fn reattach_without_stream_is_204() {
        let state = test_app_state();
        let chat_id = create_chat(&state, "u1").await;
        let (status, _) = call(
            &state,
            get(&state, "u1", &format!("/api/v1/chats/{chat_id}/stream")),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &state,
            get(&state, "u2", &format!("/api/v1/chats/{chat_id}/stream")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
