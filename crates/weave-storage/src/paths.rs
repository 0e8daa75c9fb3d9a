//! Path resolution for the Weave data directory.

use std::path::PathBuf;

use crate::error::{Result, StorageError};

const WEAVE_DIR: &str = ".weave";
const SESSIONS_DIR: &str = "sessions";

/// Environment variable to override the Weave directory.
const WEAVE_DIR_ENV: &str = "WEAVE_DIR";

/// Resolve the Weave data directory.
/// Priority: WEAVE_DIR env var > ~/.weave/
pub fn resolve_weave_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(WEAVE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::home_dir()
        .map(|h| h.join(WEAVE_DIR))
        .ok_or_else(|| StorageError::Path("failed to determine home directory".to_string()))
}

/// The default session root: `{weave_dir}/sessions`.
pub fn default_sessions_root() -> Result<PathBuf> {
    Ok(resolve_weave_dir()?.join(SESSIONS_DIR))
}
