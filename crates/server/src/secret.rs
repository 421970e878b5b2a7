//! HMAC secret used to sign gateway tokens.
//!
//! Key resolution: `TOOLRELAY_GATEWAY_SECRET` env (base64) → `<data_dir>/gateway.key` file → auto-generate.

use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{info, warn};

pub const SECRET_ENV: &str = "TOOLRELAY_GATEWAY_SECRET";

const KEY_LEN: usize = 32;
const MIN_ENV_KEY_LEN: usize = 16;

/// Load the gateway secret, creating the key file on first run.
///
/// Resolution order:
/// 1. `TOOLRELAY_GATEWAY_SECRET` env var (base64-encoded, at least 16 bytes decoded)
/// 2. `key_path` file (raw 32 bytes)
/// 3. Auto-generate and write to `key_path`
pub fn load_or_create(key_path: &Path) -> anyhow::Result<Vec<u8>> {
    if let Some(key) = from_env()? {
        return Ok(key);
    }

    match fs::read(key_path) {
        Ok(bytes) if bytes.len() == KEY_LEN => return Ok(bytes),
        Ok(bytes) => {
            warn!(
                component = "secret",
                event = "secret.key_file_invalid_length",
                length = bytes.len(),
                expected = KEY_LEN,
                "Gateway key file has wrong length"
            );
            bail!("{} has wrong length", key_path.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", key_path.display()));
        }
    }

    let rng = SystemRandom::new();
    let mut key_bytes = [0u8; KEY_LEN];
    rng.fill(&mut key_bytes)
        .map_err(|_| anyhow::anyhow!("failed to generate gateway key"))?;

    // create_new with 0600 so the key is never world-readable
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(key_path)
    {
        Ok(mut file) => {
            file.write_all(&key_bytes)
                .with_context(|| format!("writing {}", key_path.display()))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Another process won the race; use its key.
            return fs::read(key_path).with_context(|| format!("reading {}", key_path.display()));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("creating {}", key_path.display()));
        }
    }

    info!(
        component = "secret",
        event = "secret.key_generated",
        path = %key_path.display(),
        "Generated gateway signing key"
    );
    Ok(key_bytes.to_vec())
}

fn from_env() -> anyhow::Result<Option<Vec<u8>>> {
    let Ok(env_val) = std::env::var(SECRET_ENV) else {
        return Ok(None);
    };
    let trimmed = env_val.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    // Set but invalid: fail instead of silently falling through to the file.
    let decoded = BASE64
        .decode(trimmed)
        .with_context(|| format!("{SECRET_ENV} is not valid base64"))?;
    if decoded.len() < MIN_ENV_KEY_LEN {
        bail!("{SECRET_ENV} must decode to at least {MIN_ENV_KEY_LEN} bytes");
    }
    Ok(Some(decoded))
}
