//! Hashable pool key for model clients
//!
//! Two configs that normalize equal must be served by the same pooled
//! client. Inference floats are canonicalized to decimal strings so the
//! key stays `Eq + Hash`.

use serde::{Deserialize, Serialize};

use crate::spec::{AgentSpec, RuntimeSpec};

/// Normalized projection of the effective provider + model + host/region
/// + inference parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub provider: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Canonical decimal rendering of the temperature, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<String>,
    /// Canonical decimal rendering of top_p, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Render a float the same way regardless of how it was written in the
/// spec (`0.70` and `0.7` must produce one pool entry).
fn canonical_f64(value: f64) -> String {
    let mut s = format!("{value:.6}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

impl RuntimeConfig {
    /// Key for the workflow-level runtime.
    pub fn from_runtime(runtime: &RuntimeSpec) -> Self {
        Self {
            provider: runtime.provider.trim().to_lowercase(),
            model_id: runtime.model_id.trim().to_string(),
            host: runtime.host.clone(),
            region: runtime.region.clone(),
            temperature: runtime.temperature.map(canonical_f64),
            top_p: runtime.top_p.map(canonical_f64),
            max_tokens: runtime.max_tokens,
        }
    }

    /// Key for an agent, applying its overrides on top of the runtime.
    pub fn for_agent(runtime: &RuntimeSpec, agent: &AgentSpec) -> Self {
        let mut key = Self::from_runtime(runtime);
        if let Some(provider) = &agent.provider {
            key.provider = provider.trim().to_lowercase();
        }
        if let Some(model) = &agent.model {
            key.model_id = model.trim().to_string();
        }
        if let Some(temperature) = agent.temperature {
            key.temperature = Some(canonical_f64(temperature));
        }
        if let Some(top_p) = agent.top_p {
            key.top_p = Some(canonical_f64(top_p));
        }
        if let Some(max_tokens) = agent.max_tokens {
            key.max_tokens = Some(max_tokens);
        }
        key
    }

    pub fn temperature_value(&self) -> Option<f64> {
        self.temperature.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn top_p_value(&self) -> Option<f64> {
        self.top_p.as_deref().and_then(|s| s.parse().ok())
    }
}
