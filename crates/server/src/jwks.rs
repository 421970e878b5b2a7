//! Third-party JWT verification against a JWKS document.
//!
//! Keys are fetched lazily and cached. A token signed with an unknown `kid`
//! triggers a refetch, at most once per [`REFRESH_INTERVAL`].

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::AuthError;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LEEWAY_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    #[serde(default)]
    pub iat: Option<u64>,
    pub exp: u64,
}

struct KeyCache {
    keys: JwkSet,
    refreshed_at: Option<Instant>,
}

pub struct JwksVerifier {
    url: Option<String>,
    client: reqwest::Client,
    issuer: Option<String>,
    audience: Option<String>,
    cache: RwLock<KeyCache>,
}

impl JwksVerifier {
    pub fn new(url: String, issuer: Option<String>, audience: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: Some(url),
            client,
            issuer,
            audience,
            cache: RwLock::new(KeyCache {
                keys: JwkSet { keys: Vec::new() },
                refreshed_at: None,
            }),
        }
    }

    /// Verifier over a fixed key set that never refetches.
    pub fn from_key_set(keys: JwkSet, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            url: None,
            client: reqwest::Client::new(),
            issuer,
            audience,
            cache: RwLock::new(KeyCache {
                keys,
                refreshed_at: Some(Instant::now()),
            }),
        }
    }

    /// Verify `token` and return its claims. `strict` allows no clock skew
    /// and requires an `iat` that is not in the future.
    pub async fn verify(&self, token: &str, strict: bool) -> Result<JwtClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = if strict { 0 } else { DEFAULT_LEEWAY_SECS };
        validation.set_required_spec_claims(&["exp", "sub"]);
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss]);
        }

        let data = decode::<JwtClaims>(token, &key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        if strict {
            let now = jsonwebtoken::get_current_timestamp();
            match data.claims.iat {
                None => return Err(AuthError::InvalidToken("missing iat".into())),
                Some(iat) if iat > now => {
                    return Err(AuthError::InvalidToken("token issued in the future".into()))
                }
                Some(_) => {}
            }
        }
        Ok(data.claims)
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        if let Some(key) = self.cached_key(kid).await? {
            return Ok(key);
        }

        let mut cache = self.cache.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(key) = find_key(&cache.keys, kid)? {
            return Ok(key);
        }
        let due = cache
            .refreshed_at
            .map_or(true, |at| at.elapsed() >= REFRESH_INTERVAL);
        if let (Some(url), true) = (&self.url, due) {
            cache.refreshed_at = Some(Instant::now());
            match self.fetch(url).await {
                Ok(keys) => {
                    info!(
                        component = "auth",
                        event = "jwks.refreshed",
                        keys = keys.keys.len(),
                    );
                    cache.keys = keys;
                }
                Err(e) => {
                    warn!(
                        component = "auth",
                        event = "jwks.fetch_failed",
                        error = %e,
                        "Failed to fetch JWKS"
                    );
                }
            }
        } else {
            debug!(component = "auth", event = "jwks.refresh_throttled", kid = ?kid);
        }

        find_key(&cache.keys, kid)?
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown signing key {kid:?}")))
    }

    async fn cached_key(&self, kid: Option<&str>) -> Result<Option<DecodingKey>, AuthError> {
        let cache = self.cache.read().await;
        find_key(&cache.keys, kid)
    }

    async fn fetch(&self, url: &str) -> Result<JwkSet, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await
    }
}

fn find_key(keys: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>, AuthError> {
    let jwk = match kid {
        Some(kid) => keys.find(kid),
        // Without a kid only an unambiguous single-key set is usable.
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    };
    jwk.map(|jwk| DecodingKey::from_jwk(jwk).map_err(|e| AuthError::InvalidToken(e.to_string())))
        .transpose()
}
