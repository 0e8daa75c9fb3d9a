//! Shared data model for the Weave orchestration engine.
//!
//! Holds the parsed workflow specification, the durable session state
//! union, the model-pool key, engine error kinds, and observer event
//! payloads. Everything here is plain data; behavior lives in the
//! engine and ai crates.

pub mod error;
pub mod events;
pub mod result;
pub mod runtime_config;
pub mod session;
pub mod spec;

pub use error::{EngineError, Result, EXIT_PAUSE};
pub use events::{EventKind, WorkflowEvent};
pub use result::ExecutionResult;
pub use runtime_config::RuntimeConfig;
pub use session::{
    ChainState, EvaluatorState, GraphState, HitlState, HitlStepType, IterationRecord, NodeResult,
    NodeStatus, OrchestratorPhase, OrchestratorState, ParallelState, PatternState, PlannedTask,
    RoundRecord, RoutingState, SessionMetadata, SessionState, SessionStatus, StepRecord,
    TaskOutput, TokenTotals, WorkerOutput, WorkflowState,
};
pub use spec::{
    AcceptDef, AgentSpec, BackoffKind, BranchDef, Budgets, ChainConfig, ChainStep, ChooseClause,
    ContextPolicy, DagConfig, EvaluatorDef, EvaluatorOptimizerConfig, GraphConfig, GraphEdgeDef,
    GraphNodeDef, InputsSpec, OrchestratorDef, OrchestratorLimits, OrchestratorWorkersConfig,
    ParallelConfig, PatternConfig, PatternType, ReduceDef, RetrievalPolicy, ReviewGateDef,
    RouteDef, RouterDef, RoutingConfig, RuntimeSpec, SpecFormat, TaskDef, WorkerTemplate,
    WorkflowSpec,
};
