//! Central path resolution for toolrelay data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `TOOLRELAY_DATA_DIR` env > `~/.toolrelay`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const DEFAULT_DIR_NAME: &str = ".toolrelay";

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `TOOLRELAY_DATA_DIR` env > `~/.toolrelay` default.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => match std::env::var("TOOLRELAY_DATA_DIR") {
            Ok(env_val) if !env_val.trim().is_empty() => PathBuf::from(env_val),
            _ => dirs::home_dir()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))?
                .join(DEFAULT_DIR_NAME),
        },
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Current data directory. Falls back to `./.toolrelay` if `init_data_dir`
/// was never called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR_NAME))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn gateway_key_path() -> PathBuf {
    data_dir().join("gateway.key")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
