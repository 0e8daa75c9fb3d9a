//! Keyed directory layout for durable sessions.
//!
//! Each session lives under `{root}/session_{uuid}/` as three files:
//! `session.json` (metadata, variables, runtime snapshot, token usage,
//! artifacts), `pattern_state.json` (the pattern-tagged checkpoint
//! payload) and `spec_snapshot.{yaml|json}` (the spec text at creation).
//! Every file is written to a temp file in the same directory and then
//! renamed, so a concurrent `load` never observes a torn write. The
//! session id in the directory name is the concurrency boundary: one
//! writer per session.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use weave_models::session::{SessionMetadata, SessionState, SessionStatus};
use weave_models::spec::SpecFormat;
use weave_models::PatternState;

use crate::error::{Result, StorageError};
use crate::paths::default_sessions_root;

const SESSION_FILE: &str = "session.json";
const PATTERN_STATE_FILE: &str = "pattern_state.json";
const SNAPSHOT_STEM: &str = "spec_snapshot";
const AGENTS_DIR: &str = "agents";

/// The `session.json` payload: everything except `pattern_state`.
#[derive(serde::Serialize, serde::Deserialize)]
struct SessionFile {
    metadata: SessionMetadata,
    variables: indexmap::IndexMap<String, serde_json::Value>,
    runtime_config: weave_models::RuntimeSpec,
    token_usage: weave_models::TokenTotals,
    artifacts_written: Vec<String>,
}

/// Filesystem session store rooted at a sessions directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the store at the default root (`WEAVE_DIR` > `~/.weave`).
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(default_sessions_root()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("session_{id}"))
    }

    /// Persist the session. All three files appear atomic to readers;
    /// a failed save is retried once before surfacing the error.
    pub fn save(&self, state: &SessionState, spec_text: &str, format: SpecFormat) -> Result<()> {
        match self.save_once(state, spec_text, format) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    session_id = %state.session_id(),
                    error = %first,
                    "session save failed, retrying once"
                );
                self.save_once(state, spec_text, format)
            }
        }
    }

    fn save_once(&self, state: &SessionState, spec_text: &str, format: SpecFormat) -> Result<()> {
        let dir = self.session_dir(state.session_id());
        std::fs::create_dir_all(&dir)?;

        let session_file = SessionFile {
            metadata: state.metadata.clone(),
            variables: state.variables.clone(),
            runtime_config: state.runtime_config.clone(),
            token_usage: state.token_usage.clone(),
            artifacts_written: state.artifacts_written.clone(),
        };
        write_atomic(&dir, SESSION_FILE, &pretty_json(&session_file)?)?;
        write_atomic(&dir, PATTERN_STATE_FILE, &pretty_json(&state.pattern_state)?)?;

        let snapshot_name = format!("{SNAPSHOT_STEM}.{}", format.extension());
        write_atomic(&dir, &snapshot_name, spec_text.as_bytes())?;

        debug!(session_id = %state.session_id(), status = %state.metadata.status, "session saved");
        Ok(())
    }

    /// Load a session, or `None` when the id is unknown.
    pub fn load(&self, id: Uuid) -> Result<Option<SessionState>> {
        let dir = self.session_dir(id);
        if !dir.join(SESSION_FILE).exists() {
            return Ok(None);
        }

        let session_bytes = std::fs::read(dir.join(SESSION_FILE))?;
        let session_file: SessionFile = serde_json::from_slice(&session_bytes)?;
        let state_bytes = std::fs::read(dir.join(PATTERN_STATE_FILE))?;
        let pattern_state: PatternState = serde_json::from_slice(&state_bytes)?;

        Ok(Some(SessionState {
            metadata: session_file.metadata,
            variables: session_file.variables,
            runtime_config: session_file.runtime_config,
            pattern_state,
            token_usage: session_file.token_usage,
            artifacts_written: session_file.artifacts_written,
        }))
    }

    /// Read back the spec snapshot text and its format.
    pub fn load_spec_snapshot(&self, id: Uuid) -> Result<Option<(String, SpecFormat)>> {
        let dir = self.session_dir(id);
        for format in [SpecFormat::Yaml, SpecFormat::Json] {
            let path = dir.join(format!("{SNAPSHOT_STEM}.{}", format.extension()));
            if path.exists() {
                return Ok(Some((std::fs::read_to_string(path)?, format)));
            }
        }
        Ok(None)
    }

    /// List session metadata, newest first, optionally filtered by status.
    pub fn list(&self, filter: Option<SessionStatus>) -> Result<Vec<SessionMetadata>> {
        let mut sessions = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path().join(SESSION_FILE);
            if !path.exists() {
                continue;
            }
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session");
                    continue;
                }
            };
            match serde_json::from_slice::<SessionFile>(&bytes) {
                Ok(file) => {
                    if filter.is_none() || filter == Some(file.metadata.status) {
                        sessions.push(file.metadata);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt session file");
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let dir = self.session_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.session_dir(id).join(SESSION_FILE).exists()
    }

    /// Directory handed to the conversation-persistence layer. Created on
    /// first use; agents store message history under `{agents}/{agent_id}/`.
    pub fn agents_dir(&self, id: Uuid) -> Result<PathBuf> {
        let dir = self.session_dir(id).join(AGENTS_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove sessions last updated more than `max_age` ago. Completed
    /// sessions are preserved when `keep_completed` is set. Returns the
    /// number of sessions removed.
    pub fn cleanup(&self, max_age: chrono::Duration, keep_completed: bool) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0usize;

        for meta in self.list(None)? {
            if meta.updated_at > cutoff {
                continue;
            }
            if keep_completed && meta.status == SessionStatus::Completed {
                continue;
            }
            self.delete(meta.session_id)?;
            removed += 1;
        }

        Ok(removed)
    }
}

fn pretty_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write-to-temp-then-rename in the target directory, so the rename is
/// on one filesystem and readers see either the old or the new file.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(dir.join(name))
        .map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}
