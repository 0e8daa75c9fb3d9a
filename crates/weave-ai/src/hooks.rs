//! Hook descriptors attached to agents.
//!
//! Hooks are identity-bearing markers that participate in the agent
//! cache key; the engine interprets them (e.g. routing a pause through
//! the HITL handler when the approval hook is present).

use serde::{Deserialize, Serialize};

/// Name of the human-approval hook registered on HITL-gated agents.
pub const HITL_APPROVAL_HOOK: &str = "hitl_approval";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HookDescriptor {
    pub name: String,
}

impl HookDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn hitl_approval() -> Self {
        Self::new(HITL_APPROVAL_HOOK)
    }

    pub fn is_hitl_approval(&self) -> bool {
        self.name == HITL_APPROVAL_HOOK
    }
}
