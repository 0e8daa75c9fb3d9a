//! Model-client pool keyed by normalized runtime config.
//!
//! Equal keys must return the same client instance; clients are shared by
//! reference across agents and must be concurrency-safe. The cache is
//! bounded with least-recently-used eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use weave_models::RuntimeConfig;

use crate::error::{AiError, Result};
use crate::llm::anthropic::AnthropicClient;
use crate::llm::client::ModelClient;
use crate::llm::mock::MockClient;
use crate::llm::openai::OpenAiClient;

const DEFAULT_CAPACITY: usize = 32;

/// Builds a client for a config the pool has not seen before.
pub type ClientFactory =
    dyn Fn(&RuntimeConfig) -> Result<Arc<dyn ModelClient>> + Send + Sync;

struct PoolInner {
    entries: HashMap<RuntimeConfig, Arc<dyn ModelClient>>,
    /// Keys ordered least-recently-used first.
    order: Vec<RuntimeConfig>,
}

/// Bounded, memoizing pool of provider clients.
pub struct ModelPool {
    factory: Box<ClientFactory>,
    inner: Mutex<PoolInner>,
    capacity: usize,
    builds: AtomicUsize,
}

impl ModelPool {
    pub fn new() -> Self {
        Self::with_factory(Box::new(default_factory))
    }

    pub fn with_factory(factory: Box<ClientFactory>) -> Self {
        Self {
            factory,
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            capacity: DEFAULT_CAPACITY,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(16);
        self
    }

    /// Fetch the shared client for a config, building it on first use.
    pub fn get(&self, key: &RuntimeConfig) -> Result<Arc<dyn ModelClient>> {
        let mut inner = self.inner.lock();

        if let Some(client) = inner.entries.get(key).cloned() {
            touch(&mut inner.order, key);
            return Ok(client);
        }

        let client = (self.factory)(key)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        inner.entries.insert(key.clone(), client.clone());
        inner.order.push(key.clone());

        if inner.entries.len() > self.capacity {
            let evicted = inner.order.remove(0);
            inner.entries.remove(&evicted);
        }

        Ok(client)
    }

    /// How many clients the factory has built.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Default for ModelPool {
    fn default() -> Self {
        Self::new()
    }
}

fn touch(order: &mut Vec<RuntimeConfig>, key: &RuntimeConfig) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let k = order.remove(pos);
        order.push(k);
    }
}

/// Build a real provider client from environment credentials, or the
/// deterministic mock for `provider: mock`.
fn default_factory(key: &RuntimeConfig) -> Result<Arc<dyn ModelClient>> {
    match key.provider.as_str() {
        "mock" => Ok(Arc::new(MockClient::new(key.model_id.clone()))),
        "anthropic" => {
            let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
                AiError::Llm("ANTHROPIC_API_KEY is required for provider 'anthropic'".to_string())
            })?;
            let mut client = AnthropicClient::new(api_key).with_model(key.model_id.clone());
            if let Some(host) = &key.host {
                client = client.with_base_url(host.clone());
            }
            Ok(Arc::new(client))
        }
        _ => {
            let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
                AiError::Llm(format!(
                    "OPENAI_API_KEY is required for provider '{}'",
                    key.provider
                ))
            })?;
            let mut client = OpenAiClient::new(api_key).with_model(key.model_id.clone());
            if let Some(host) = &key.host {
                client = client.with_base_url(host.clone());
            }
            Ok(Arc::new(client))
        }
    }
}
