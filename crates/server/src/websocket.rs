//! WebSocket transport: authenticate the upgrade, then pump frames between
//! the socket and the user's session actor.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use toolrelay_protocol::{AgentInbound, CliInbound, FrontendInbound, Role};

use crate::auth::bearer_token;
use crate::connection::{Connection, ConnectionId, OutboundMessage, CONNECTION_BUFFER_SIZE};
use crate::session_actor::UserSessionHandle;
use crate::session_command::SessionCommand;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserStreamParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `GET /agent-streams`: the user's local agent. Requires an agent token.
pub async fn agent_stream_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let user_id = match bearer_token(&headers, &uri) {
        Ok(token) => state.auth.verify_agent_token(&token).await,
        Err(e) => Err(e),
    };
    upgrade(ws, state, Role::Agent, user_id)
}

/// `GET /api/v1/user-streams?type=cli|frontend`: browser tabs and the cli.
pub async fn user_stream_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Query(params): Query<UserStreamParams>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let role = Role::from_user_stream_param(params.kind.as_deref());
    let user_id = match bearer_token(&headers, &uri) {
        Ok(token) => state.auth.resolve_user_id(&token).await,
        Err(e) => Err(e),
    };
    upgrade(ws, state, role, user_id)
}

/// Authentication is checked before the upgrade, so a rejected client gets
/// a plain 401 and the socket is never accepted.
fn upgrade(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    state: AppState,
    role: Role,
    user_id: Result<String, crate::auth::AuthError>,
) -> Response {
    let user_id = match user_id {
        Ok(user_id) => user_id,
        Err(e) => {
            info!(
                component = "websocket",
                event = "ws.upgrade.unauthorized",
                role = %role,
                error = %e,
            );
            return e.into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let session = state.sessions.session(&user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, session, role))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, session: UserSessionHandle, role: Role) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(CONNECTION_BUFFER_SIZE);

    let connection = Connection::new(role, session.user_id.clone(), outbound_tx.clone());
    let conn_id = connection.id;
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        user_id = %session.user_id,
        role = %role,
        "WebSocket connection opened"
    );

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Text(json) => ws_tx.send(Message::Text(json.into())).await,
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    session.send(SessionCommand::Connect { connection }).await;

    // Handle incoming messages
    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.try_send(OutboundMessage::Pong(data));
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        if let Some(cmd) = parse_frame(role, conn_id, text.as_str()) {
            session.send(cmd).await;
        }
    }

    session
        .send(SessionCommand::Disconnect {
            role,
            connection_id: conn_id,
        })
        .await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        user_id = %session.user_id,
        role = %role,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Decode a frame with the schema for the socket's role. Malformed frames
/// are dropped; the socket stays open.
fn parse_frame(role: Role, connection_id: ConnectionId, text: &str) -> Option<SessionCommand> {
    let parsed = match role {
        Role::Frontend => serde_json::from_str::<FrontendInbound>(text)
            .map(|message| SessionCommand::FrontendMessage {
                connection_id,
                message,
            }),
        Role::Cli => serde_json::from_str::<CliInbound>(text).map(|message| {
            SessionCommand::CliMessage {
                connection_id,
                message,
            }
        }),
        Role::Agent => serde_json::from_str::<AgentInbound>(text).map(|message| {
            SessionCommand::AgentMessage {
                connection_id,
                message,
            }
        }),
    };

    match parsed {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            debug!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id,
                role = %role,
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, 240),
                "Dropping malformed frame"
            );
            None
        }
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
