//! Gateway tokens: `gw.<base64url(claims json)>.<base64url(HMAC-SHA256)>`.
//!
//! Issued by this server (`generate-token`) and verified locally against the
//! gateway secret. The signature covers the `gw.<claims>` prefix.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;

pub const PREFIX: &str = "gw";
pub const AGENT_AUDIENCE: &str = "agent";
/// Clock skew tolerated by the non-strict check.
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayClaims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

pub fn looks_like_gateway_token(token: &str) -> bool {
    token.starts_with("gw.")
}

#[derive(Clone)]
pub struct GatewaySigner {
    key: hmac::Key,
}

impl GatewaySigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    pub fn issue(&self, claims: &GatewayClaims) -> Result<String, AuthError> {
        let json = serde_json::to_vec(claims).map_err(|e| AuthError::Internal(e.to_string()))?;
        let signing_input = format!("{PREFIX}.{}", B64URL.encode(json));
        let tag = hmac::sign(&self.key, signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", B64URL.encode(tag.as_ref())))
    }

    /// Verify signature and expiry. `strict` is the agent-socket check: it
    /// requires `aud == "agent"` and allows no clock skew.
    pub fn verify(&self, token: &str, strict: bool, now: u64) -> Result<GatewayClaims, AuthError> {
        let (signing_input, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| AuthError::InvalidToken("malformed gateway token".into()))?;
        let payload = signing_input
            .strip_prefix("gw.")
            .ok_or_else(|| AuthError::InvalidToken("malformed gateway token".into()))?;

        let signature = B64URL
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken("malformed gateway signature".into()))?;
        hmac::verify(&self.key, signing_input.as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidToken("bad gateway signature".into()))?;

        let json = B64URL
            .decode(payload)
            .map_err(|_| AuthError::InvalidToken("malformed gateway claims".into()))?;
        let claims: GatewayClaims = serde_json::from_slice(&json)
            .map_err(|e| AuthError::InvalidToken(format!("gateway claims: {e}")))?;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }

        let leeway = if strict { 0 } else { DEFAULT_LEEWAY_SECS };
        if claims.exp.saturating_add(leeway) <= now {
            return Err(AuthError::TokenExpired);
        }
        if strict {
            if claims.aud.as_deref() != Some(AGENT_AUDIENCE) {
                return Err(AuthError::InvalidToken("token audience is not agent".into()));
            }
            if claims.iat > now {
                return Err(AuthError::InvalidToken("token issued in the future".into()));
            }
        }
        Ok(claims)
    }
}
