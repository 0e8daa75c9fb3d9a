//! Workflow specification types
//!
//! A specification is parsed in two stages: serde deserializes the outer
//! document, then the pattern-specific `pattern.config` payload is typed
//! against `pattern_type`. The original text is retained for hashing and
//! session snapshots.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

/// The seven orchestration patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Chain,
    Workflow,
    Parallel,
    Routing,
    EvaluatorOptimizer,
    OrchestratorWorkers,
    Graph,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chain => "chain",
            Self::Workflow => "workflow",
            Self::Parallel => "parallel",
            Self::Routing => "routing",
            Self::EvaluatorOptimizer => "evaluator_optimizer",
            Self::OrchestratorWorkers => "orchestrator_workers",
            Self::Graph => "graph",
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff schedule applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Constant,
    #[default]
    Exponential,
    Jittered,
}

/// Resource ceilings enforced during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Budgets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_s: Option<u64>,
}

/// Effective provider/model runtime for the whole workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSpec {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budgets: Option<Budgets>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_retries() -> u32 {
    2
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model(),
            region: None,
            host: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_parallel: default_max_parallel(),
            budgets: None,
            retries: default_retries(),
            backoff: BackoffKind::default(),
        }
    }
}

impl RuntimeSpec {
    pub fn budgets(&self) -> Budgets {
        self.budgets.clone().unwrap_or_default()
    }
}

/// Per-agent definition: prompt, tools, optional runtime overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentSpec {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Provided input variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputsSpec {
    #[serde(default)]
    pub values: IndexMap<String, Value>,
}

/// Retrieval section of the context policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalPolicy {
    #[serde(default)]
    pub jit_tools: Vec<String>,
}

/// Policy knobs that influence agent construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalPolicy>,
}

/// One step of a chain (also used for routed sub-chains and branch steps).
///
/// A step is either an agent invocation (`agent` + `input`) or a HITL gate
/// (`type: hitl` or `hitl: true`, with `prompt`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// HITL response deadline in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl: Option<bool>,
}

impl ChainStep {
    pub fn is_hitl(&self) -> bool {
        self.hitl == Some(true) || self.step_type.as_deref() == Some("hitl")
    }

    /// The template rendered for this step (`input` for agents, `prompt`
    /// for HITL gates).
    pub fn template(&self) -> &str {
        self.input
            .as_deref()
            .or(self.prompt.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub steps: Vec<ChainStep>,
}

/// One task of a workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskDef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl TaskDef {
    pub fn is_hitl(&self) -> bool {
        self.step_type.as_deref() == Some("hitl")
    }

    pub fn template(&self) -> &str {
        self.input
            .as_deref()
            .or(self.prompt.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    pub tasks: Vec<TaskDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDef {
    pub id: String,
    pub steps: Vec<ChainStep>,
}

/// Aggregation step over branch or worker outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceDef {
    pub agent: String,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub branches: Vec<BranchDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce: Option<ReduceDef>,
    /// Optional HITL gate between branch completion and reduce; the
    /// response is available to the reduce template as `hitl_response`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewGateDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDef {
    pub agent: String,
    pub input: String,
    #[serde(default = "default_router_retries")]
    pub max_retries: u32,
}

fn default_router_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDef {
    pub then: Vec<ChainStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub router: RouterDef,
    pub routes: IndexMap<String, RouteDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorDef {
    pub agent: String,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptDef {
    pub min_score: i64,
    pub max_iters: u32,
}

/// Interactive review gate shared by evaluator and orchestrator patterns.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewGateDef {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorOptimizerConfig {
    pub producer: String,
    pub input: String,
    pub evaluator: EvaluatorDef,
    pub accept: AcceptDef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revise_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_gate: Option<ReviewGateDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorLimits {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_max_workers() -> usize {
    4
}

fn default_max_rounds() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorDef {
    pub agent: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<OrchestratorLimits>,
}

impl OrchestratorDef {
    pub fn limits(&self) -> OrchestratorLimits {
        self.limits.clone().unwrap_or_else(|| OrchestratorLimits {
            max_workers: default_max_workers(),
            max_rounds: default_max_rounds(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorWorkersConfig {
    pub orchestrator: OrchestratorDef,
    pub worker_template: WorkerTemplate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition_review: Option<ReviewGateDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_review: Option<ReviewGateDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce: Option<ReduceDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writeup: Option<ReduceDef>,
}

/// A graph node: agent invocation or HITL gate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphNodeDef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl GraphNodeDef {
    pub fn is_hitl(&self) -> bool {
        self.step_type.as_deref() == Some("hitl")
    }

    pub fn template(&self) -> &str {
        self.input
            .as_deref()
            .or(self.prompt.as_deref())
            .unwrap_or_default()
    }
}

/// Conditional branch of a graph edge; first truthy `when` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChooseClause {
    pub when: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdgeDef {
    pub from: String,
    /// Unconditional successor list. Only the first entry is followed;
    /// additional entries are validated and reserved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choose: Option<Vec<ChooseClause>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_iterations")]
    pub max_iterations: u32,
    pub nodes: IndexMap<String, GraphNodeDef>,
    #[serde(default)]
    pub edges: Vec<GraphEdgeDef>,
}

fn default_graph_iterations() -> u32 {
    10
}

/// Typed pattern configuration, selected by `pattern_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PatternConfig {
    Chain(ChainConfig),
    Workflow(DagConfig),
    Parallel(ParallelConfig),
    Routing(RoutingConfig),
    EvaluatorOptimizer(EvaluatorOptimizerConfig),
    OrchestratorWorkers(OrchestratorWorkersConfig),
    Graph(GraphConfig),
}

/// Source encoding of the spec document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecFormat {
    Yaml,
    Json,
}

impl SpecFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }

    pub fn from_path(path: &std::path::Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPatternSection {
    config: Value,
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    name: String,
    pattern_type: PatternType,
    #[serde(default)]
    runtime: RuntimeSpec,
    #[serde(default)]
    agents: IndexMap<String, AgentSpec>,
    pattern: RawPatternSection,
    #[serde(default)]
    inputs: InputsSpec,
    #[serde(default)]
    context_policy: Option<ContextPolicy>,
}

/// A parsed, immutable workflow specification.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub name: String,
    pub pattern_type: PatternType,
    pub runtime: RuntimeSpec,
    pub agents: IndexMap<String, AgentSpec>,
    pub config: PatternConfig,
    pub inputs: InputsSpec,
    pub context_policy: Option<ContextPolicy>,
    /// Original document text, retained for hashing and session snapshots.
    pub source_text: String,
    pub source_format: SpecFormat,
}

impl WorkflowSpec {
    /// Parse a spec document and type its pattern config.
    pub fn parse(text: &str, format: SpecFormat) -> Result<Self> {
        let raw: RawSpec = match format {
            SpecFormat::Yaml => serde_yaml::from_str(text)
                .map_err(|e| EngineError::Validation(format!("invalid spec: {e}")))?,
            SpecFormat::Json => serde_json::from_str(text)
                .map_err(|e| EngineError::Validation(format!("invalid spec: {e}")))?,
        };

        let config = Self::type_config(raw.pattern_type, raw.pattern.config)?;

        Ok(Self {
            name: raw.name,
            pattern_type: raw.pattern_type,
            runtime: raw.runtime,
            agents: raw.agents,
            config,
            inputs: raw.inputs,
            context_policy: raw.context_policy,
            source_text: text.to_string(),
            source_format: format,
        })
    }

    /// Load a spec from disk, picking the format from the extension.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&text, SpecFormat::from_path(path))
    }

    fn type_config(pattern: PatternType, config: Value) -> Result<PatternConfig> {
        let wrong_shape =
            |e: serde_json::Error| EngineError::Validation(format!("invalid {pattern} config: {e}"));
        Ok(match pattern {
            PatternType::Chain => PatternConfig::Chain(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
            PatternType::Workflow => PatternConfig::Workflow(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
            PatternType::Parallel => PatternConfig::Parallel(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
            PatternType::Routing => PatternConfig::Routing(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
            PatternType::EvaluatorOptimizer => PatternConfig::EvaluatorOptimizer(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
            PatternType::OrchestratorWorkers => PatternConfig::OrchestratorWorkers(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
            PatternType::Graph => PatternConfig::Graph(
                serde_json::from_value(config).map_err(wrong_shape)?,
            ),
        })
    }

    /// SHA-256 over the on-disk spec text, hex-encoded.
    pub fn spec_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_text.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Look up an agent definition by id.
    pub fn agent(&self, id: &str) -> Result<&AgentSpec> {
        self.agents
            .get(id)
            .ok_or_else(|| EngineError::Validation(format!("undefined agent '{id}'")))
    }
}
