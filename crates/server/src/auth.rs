//! Bearer-token authentication.
//!
//! Tokens come from `Authorization: Bearer <token>` or, for WebSocket
//! upgrades that cannot set headers, a `?token=<token>` query parameter. The
//! header wins when both are present. Gateway tokens (`gw.` prefix) are
//! verified locally; anything else goes to the JWKS verifier when configured.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::dispatch::ApiError;
use crate::gateway_token::{self, GatewayClaims, GatewaySigner};
use crate::jwks::JwksVerifier;
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    /// Upgrade rejections carry the reason as a plain-text body.
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, self.to_string()).into_response()
    }
}

/// Pull the bearer token out of a request. Header first, then `?token=`.
pub fn bearer_token(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::InvalidAuthHeader)?;
        return Ok(token.to_string());
    }

    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri)
        .map_err(|_| AuthError::MissingToken)?;
    params
        .get("token")
        .filter(|t| !t.is_empty())
        .cloned()
        .ok_or(AuthError::MissingToken)
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Token verifier: user id from a bearer token.
pub struct Authenticator {
    gateway: GatewaySigner,
    jwks: Option<JwksVerifier>,
}

impl Authenticator {
    pub fn new(gateway_secret: &[u8], jwks: Option<JwksVerifier>) -> Self {
        Self {
            gateway: GatewaySigner::new(gateway_secret),
            jwks,
        }
    }

    /// User id for browser and cli sockets and the HTTP API.
    pub async fn resolve_user_id(&self, token: &str) -> Result<String, AuthError> {
        self.verify(token, false).await
    }

    /// User id for the agent socket: audience must be `agent`, no clock skew.
    pub async fn verify_agent_token(&self, token: &str) -> Result<String, AuthError> {
        self.verify(token, true).await
    }

    async fn verify(&self, token: &str, strict: bool) -> Result<String, AuthError> {
        let result = if gateway_token::looks_like_gateway_token(token) {
            self.gateway
                .verify(token, strict, unix_secs())
                .map(|claims| claims.sub)
        } else if let Some(jwks) = &self.jwks {
            jwks.verify(token, strict).await.map(|claims| claims.sub)
        } else {
            Err(AuthError::InvalidToken("unrecognized token".into()))
        };

        if let Err(e) = &result {
            debug!(
                component = "auth",
                event = "auth.token_rejected",
                strict,
                error = %e,
            );
        }
        result
    }

    /// Issue a gateway token for `user_id`. Agent tokens carry `aud: agent`.
    pub fn issue_gateway_token(
        &self,
        user_id: &str,
        agent: bool,
        ttl_secs: u64,
    ) -> Result<String, AuthError> {
        let iat = unix_secs();
        self.gateway.issue(&GatewayClaims {
            sub: user_id.to_string(),
            iat,
            exp: iat.saturating_add(ttl_secs),
            aud: agent.then(|| gateway_token::AGENT_AUDIENCE.to_string()),
        })
    }
}

/// Authenticated caller of an HTTP API route.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers, &parts.uri)?;
        let user_id = state.auth.resolve_user_id(&token).await?;
        Ok(AuthUser { user_id })
    }
}
