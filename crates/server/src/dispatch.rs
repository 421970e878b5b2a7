//! One-shot dispatch from HTTP handlers to a user's agent, and the mapping
//! of its failures onto HTTP responses.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use toolrelay_protocol::AgentRequest;

use crate::auth::AuthError;
use crate::error::DispatchError;
use crate::state::SessionRegistry;

pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const SNAPSHOT_CREATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SNAPSHOT_RESTORE_TIMEOUT: Duration = Duration::from_secs(30);
pub const CODEX_RPC_TIMEOUT: Duration = Duration::from_secs(15);

pub const SNAPSHOT_CREATE: &str = "daemon:snapshot_create";
pub const SNAPSHOT_RESTORE: &str = "daemon:snapshot_restore";

/// Time budget for an agent RPC method.
pub fn rpc_timeout(method: &str) -> Duration {
    match method {
        SNAPSHOT_CREATE => SNAPSHOT_CREATE_TIMEOUT,
        SNAPSHOT_RESTORE => SNAPSHOT_RESTORE_TIMEOUT,
        m if m.starts_with("codex:") => CODEX_RPC_TIMEOUT,
        _ => RPC_TIMEOUT,
    }
}

/// Error returned by HTTP API handlers. Serialized as `{error, message}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(#[from] AuthError),

    #[error("{0}")]
    NotFound(String),

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Dispatch(e) if e.is_agent_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Dispatch(DispatchError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Dispatch(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Dispatch(e) => e.code(),
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(
                component = "api",
                event = "api.request_failed",
                status = status.as_u16(),
                code = self.code(),
                error = %self,
            );
        }
        let body = Json(ApiErrorBody {
            error: self.code(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Fail fast with 503 when the user's agent socket is not connected.
pub fn require_agent(sessions: &SessionRegistry, user_id: &str) -> Result<(), ApiError> {
    if sessions.is_agent_connected(user_id) {
        Ok(())
    } else {
        Err(DispatchError::NoAgentConnected.into())
    }
}

/// Send one RPC to the user's agent and wait for its result.
pub async fn agent_rpc(
    sessions: &SessionRegistry,
    user_id: &str,
    method: &str,
    args: Value,
    timeout: Duration,
) -> Result<Value, ApiError> {
    require_agent(sessions, user_id)?;
    let request = AgentRequest::rpc(method, args);
    sessions
        .session(user_id)
        .dispatch(request, timeout)
        .await
        .map_err(ApiError::from)
}
