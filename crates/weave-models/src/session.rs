//! Durable session state: metadata, pattern-specific checkpoint payloads,
//! HITL pause bookkeeping.
//!
//! `pattern_state.current_*` always names the next unit to execute, never
//! the one just completed. Executors compute the successor before every
//! save; resume relies on it to skip completed work without re-running it.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::spec::{PatternType, RuntimeSpec};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Whether this status may transition to `to`.
    ///
    /// `running -> {paused, completed, failed}`, `paused -> running`;
    /// terminal states never transition.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        match (self, to) {
            (Self::Running, Self::Paused)
            | (Self::Running, Self::Completed)
            | (Self::Running, Self::Failed)
            | (Self::Paused, Self::Running) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub workflow_name: String,
    /// SHA-256 of the spec text at session creation. Immutable; a resume
    /// with a different on-disk spec warns but proceeds.
    pub spec_hash: String,
    pub pattern_type: PatternType,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cumulative token accounting for the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenTotals {
    pub total_input: u64,
    pub total_output: u64,
    #[serde(default)]
    pub by_agent: IndexMap<String, u64>,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.total_input + self.total_output
    }

    pub fn record(&mut self, agent_id: &str, input: u64, output: u64) {
        self.total_input += input;
        self.total_output += output;
        *self.by_agent.entry(agent_id.to_string()).or_insert(0) += input + output;
    }
}

/// Which kind of parallel step a HITL pause occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlStepType {
    Branch,
    Reduce,
}

/// An active (or answered) human-in-the-loop pause.
///
/// Exactly one locator group is populated: `step_index` (chain),
/// `task_id` + `layer_index` (workflow), `branch_id` + `step_type`
/// (parallel), `node_id` (graph), `iteration` + `gate` (evaluator),
/// `round` + `gate` (orchestrator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlState {
    pub active: bool,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<HitlStepType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    /// Gate name for evaluator/orchestrator reviews
    /// (`review_gate`, `decomposition_review`, `reduce_review`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
}

impl HitlState {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            active: true,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_context_display(mut self, display: Option<String>) -> Self {
        self.context_display = display;
        self
    }

    pub fn with_default_response(mut self, default: Option<String>) -> Self {
        self.default_response = default;
        self
    }

    pub fn with_timeout(mut self, timeout_s: Option<u64>, now: DateTime<Utc>) -> Self {
        self.timeout_at = timeout_s.map(|s| now + chrono::Duration::seconds(s as i64));
        self
    }
}

/// One completed unit of a chain (agent step or answered HITL gate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub agent: String,
    pub response: String,
    pub tokens_estimated: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainState {
    /// Index of the next step to execute.
    pub current_step: usize,
    #[serde(default)]
    pub step_history: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_state: Option<HitlState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub response: String,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutput {
    pub fn ok(response: impl Into<String>, tokens: u64) -> Self {
        Self {
            response: response.into(),
            tokens,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub task_outputs: IndexMap<String, TaskOutput>,
    /// Topological layers computed at planning time.
    #[serde(default)]
    pub layers: Vec<Vec<String>>,
    /// Index of the next layer to execute (or finish, after a HITL pause).
    pub current_layer: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_state: Option<HitlState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelState {
    #[serde(default)]
    pub completed_branches: Vec<String>,
    #[serde(default)]
    pub branch_outputs: IndexMap<String, TaskOutput>,
    /// Mini-chain state for branches still in flight (HITL pauses land here).
    #[serde(default)]
    pub branch_states: IndexMap<String, ChainState>,
    pub reduce_done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_state: Option<HitlState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_choice: Option<String>,
    /// State of the routed sub-chain, once a route is chosen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed: Option<ChainState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iter: u32,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorState {
    /// Next iteration to run (zero-based).
    pub current_iteration: u32,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    pub converged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_state: Option<HitlState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub task: String,
    pub response: String,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    #[serde(default)]
    pub plan: Vec<PlannedTask>,
    #[serde(default)]
    pub worker_outputs: Vec<WorkerOutput>,
}

/// Where an orchestrator-workers run resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    #[default]
    Plan,
    Workers,
    Reduce,
    Writeup,
    Done,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorState {
    /// Next round to plan or finish (zero-based).
    pub current_round: u32,
    #[serde(default)]
    pub rounds: Vec<RoundRecord>,
    #[serde(default)]
    pub phase: OrchestratorPhase,
    /// Most recent raw orchestrator reply, for reduce/writeup templates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_response: Option<String>,
    pub reduce_done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_output: Option<String>,
    pub writeup_done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writeup_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_state: Option<HitlState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    WaitingForUser,
    NotExecuted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub response: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub status: NodeStatus,
    pub iteration: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphState {
    /// The next node to execute; `None` once the graph is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    #[serde(default)]
    pub node_results: IndexMap<String, NodeResult>,
    #[serde(default)]
    pub iteration_counts: IndexMap<String, u32>,
    #[serde(default)]
    pub execution_path: Vec<String>,
    pub total_steps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_state: Option<HitlState>,
}

/// Pattern-specific checkpoint payload (`pattern_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum PatternState {
    Chain(ChainState),
    Workflow(WorkflowState),
    Parallel(ParallelState),
    Routing(RoutingState),
    EvaluatorOptimizer(EvaluatorState),
    OrchestratorWorkers(OrchestratorState),
    Graph(GraphState),
}

impl PatternState {
    /// Fresh initial state for the given pattern.
    pub fn initial(pattern: PatternType) -> Self {
        match pattern {
            PatternType::Chain => Self::Chain(ChainState::default()),
            PatternType::Workflow => Self::Workflow(WorkflowState::default()),
            PatternType::Parallel => Self::Parallel(ParallelState::default()),
            PatternType::Routing => Self::Routing(RoutingState::default()),
            PatternType::EvaluatorOptimizer => Self::EvaluatorOptimizer(EvaluatorState::default()),
            PatternType::OrchestratorWorkers => {
                Self::OrchestratorWorkers(OrchestratorState::default())
            }
            PatternType::Graph => Self::Graph(GraphState::default()),
        }
    }

    /// The active HITL pause, if any.
    pub fn hitl_state(&self) -> Option<&HitlState> {
        let hitl = match self {
            Self::Chain(s) => s.hitl_state.as_ref(),
            Self::Workflow(s) => s.hitl_state.as_ref(),
            Self::Parallel(s) => s.hitl_state.as_ref(),
            Self::Routing(s) => s.routed.as_ref().and_then(|c| c.hitl_state.as_ref()),
            Self::EvaluatorOptimizer(s) => s.hitl_state.as_ref(),
            Self::OrchestratorWorkers(s) => s.hitl_state.as_ref(),
            Self::Graph(s) => s.hitl_state.as_ref(),
        };
        hitl.filter(|h| h.active)
    }
}

/// Full persistent session payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    pub runtime_config: RuntimeSpec,
    pub pattern_state: PatternState,
    #[serde(default)]
    pub token_usage: TokenTotals,
    #[serde(default)]
    pub artifacts_written: Vec<String>,
}

impl SessionState {
    /// Create a fresh running session for a workflow.
    pub fn new(
        workflow_name: impl Into<String>,
        spec_hash: impl Into<String>,
        pattern_type: PatternType,
        runtime: RuntimeSpec,
        variables: IndexMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            metadata: SessionMetadata {
                session_id: Uuid::new_v4(),
                workflow_name: workflow_name.into(),
                spec_hash: spec_hash.into(),
                pattern_type,
                status: SessionStatus::Running,
                created_at: now,
                updated_at: now,
                error: None,
            },
            variables,
            runtime_config: runtime,
            pattern_state: PatternState::initial(pattern_type),
            token_usage: TokenTotals::default(),
            artifacts_written: Vec::new(),
        }
    }

    /// Transition session status, enforcing the lifecycle rules.
    pub fn transition(&mut self, to: SessionStatus) -> Result<()> {
        if !self.metadata.status.can_transition_to(to) {
            return Err(EngineError::Validation(format!(
                "illegal status transition {} -> {}",
                self.metadata.status, to
            )));
        }
        self.metadata.status = to;
        self.metadata.updated_at = Utc::now();
        Ok(())
    }

    pub fn session_id(&self) -> Uuid {
        self.metadata.session_id
    }
}
