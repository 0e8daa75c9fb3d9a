//! Durable orchestration engine for declarative multi-agent workflows.
//!
//! Plans an execution graph of agent invocations from a validated
//! specification, runs it under one of seven patterns with bounded
//! concurrency and resource budgets, and checkpoints state so crashed,
//! paused, or human-gated runs resume where they left off.

pub mod context;
pub mod events;
pub mod executor;
pub mod patterns;
pub mod resume;
pub mod template;
pub mod validate;

pub use context::{ExecutionContext, HitlHandler};
pub use events::{EventBus, EventHandler};
pub use executor::{Engine, ExecuteOptions};
pub use patterns::{Outcome, ResumeMode};
