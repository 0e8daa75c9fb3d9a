//! Build-once agent cache.
//!
//! Keyed by agent id plus a stable hash of every override and hook
//! descriptor plus the session handle. Concurrent callers for one key
//! serialize on a per-key lock, so fan-out converges on a single built
//! agent. The cache owns its agents: `close()` releases every agent's
//! transports and is idempotent.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::agent::Agent;
use crate::error::{AiError, Result};

/// Composite cache key for one built agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub agent_id: String,
    pub fingerprint: String,
}

impl AgentKey {
    /// Build a key from the agent id, any serializable override/hook
    /// descriptor bundle, and the session handle.
    pub fn new<T: serde::Serialize>(
        agent_id: impl Into<String>,
        descriptors: &T,
        session_handle: Option<&str>,
    ) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(descriptors)?);
        hasher.update(b"\x1f");
        hasher.update(session_handle.unwrap_or_default().as_bytes());
        let digest = hasher.finalize();
        let fingerprint: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
        Ok(Self {
            agent_id: agent_id.into(),
            fingerprint,
        })
    }

    fn cache_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.fingerprint)
    }
}

/// Shared cache of live agents for one workflow run.
pub struct AgentCache {
    agents: DashMap<String, Arc<Agent>>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
    builds: AtomicUsize,
    closed: AtomicBool,
}

impl Default for AgentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCache {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            build_locks: DashMap::new(),
            builds: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Fetch the agent for `key`, building it at most once per key even
    /// under concurrent fan-out.
    pub async fn get_or_build<F, Fut>(&self, key: &AgentKey, build: F) -> Result<Arc<Agent>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Agent>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AiError::Agent("agent cache is closed".to_string()));
        }

        let cache_key = key.cache_key();
        if let Some(agent) = self.agents.get(&cache_key) {
            return Ok(agent.clone());
        }

        // Serialize builds per key, not globally.
        let lock = self
            .build_locks
            .entry(cache_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(agent) = self.agents.get(&cache_key) {
            return Ok(agent.clone());
        }

        debug!(agent_id = %key.agent_id, fingerprint = %key.fingerprint, "building agent");
        let agent = Arc::new(build().await?);
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.agents.insert(cache_key, agent.clone());
        Ok(agent)
    }

    /// How many agents have been built.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Release transport resources of all built agents. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.agents.iter() {
            entry.value().close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
