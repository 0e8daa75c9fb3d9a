//! Pre-flight spec validation.
//!
//! Everything here fails before the first provider invocation: DAG
//! cycles, unknown dependencies, invalid edge targets, undefined agents,
//! and structurally impossible pattern configs.

use std::collections::{HashMap, HashSet};

use weave_models::error::{EngineError, Result};
use weave_models::spec::{
    ChainStep, DagConfig, GraphConfig, PatternConfig, TaskDef, WorkflowSpec,
};

/// Validate a parsed spec against its own agent table and pattern shape.
pub fn validate(spec: &WorkflowSpec) -> Result<()> {
    match &spec.config {
        PatternConfig::Chain(config) => {
            if config.steps.is_empty() {
                return Err(EngineError::Validation("chain has no steps".to_string()));
            }
            check_steps(spec, &config.steps)?;
        }
        PatternConfig::Workflow(config) => {
            if config.tasks.is_empty() {
                return Err(EngineError::Validation("workflow has no tasks".to_string()));
            }
            for task in &config.tasks {
                if !task.is_hitl() {
                    check_agent(spec, task.agent.as_deref(), &format!("task '{}'", task.id))?;
                }
            }
            dag_layers(config)?;
        }
        PatternConfig::Parallel(config) => {
            if config.branches.len() < 2 {
                return Err(EngineError::Validation(
                    "parallel requires at least two branches".to_string(),
                ));
            }
            let mut seen = HashSet::new();
            for branch in &config.branches {
                if !seen.insert(branch.id.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "duplicate branch id '{}'",
                        branch.id
                    )));
                }
                if branch.steps.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "branch '{}' has no steps",
                        branch.id
                    )));
                }
                check_steps(spec, &branch.steps)?;
            }
            if let Some(reduce) = &config.reduce {
                check_agent(spec, Some(&reduce.agent), "reduce step")?;
            }
        }
        PatternConfig::Routing(config) => {
            check_agent(spec, Some(&config.router.agent), "router")?;
            if config.routes.is_empty() {
                return Err(EngineError::Validation(
                    "routing requires at least one route".to_string(),
                ));
            }
            for (name, route) in &config.routes {
                if route.then.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "route '{name}' has no steps"
                    )));
                }
                check_steps(spec, &route.then)?;
            }
        }
        PatternConfig::EvaluatorOptimizer(config) => {
            check_agent(spec, Some(&config.producer), "producer")?;
            check_agent(spec, Some(&config.evaluator.agent), "evaluator")?;
            if config.accept.max_iters == 0 {
                return Err(EngineError::Validation(
                    "accept.max_iters must be at least 1".to_string(),
                ));
            }
        }
        PatternConfig::OrchestratorWorkers(config) => {
            check_agent(spec, Some(&config.orchestrator.agent), "orchestrator")?;
            check_agent(spec, Some(&config.worker_template.agent), "worker template")?;
            if let Some(reduce) = &config.reduce {
                check_agent(spec, Some(&reduce.agent), "reduce step")?;
            }
            if let Some(writeup) = &config.writeup {
                check_agent(spec, Some(&writeup.agent), "writeup step")?;
            }
        }
        PatternConfig::Graph(config) => validate_graph(spec, config)?,
    }
    Ok(())
}

fn check_steps(spec: &WorkflowSpec, steps: &[ChainStep]) -> Result<()> {
    for (index, step) in steps.iter().enumerate() {
        if !step.is_hitl() {
            check_agent(spec, step.agent.as_deref(), &format!("step {index}"))?;
        }
    }
    Ok(())
}

fn check_agent(spec: &WorkflowSpec, agent: Option<&str>, location: &str) -> Result<()> {
    let Some(agent) = agent else {
        return Err(EngineError::Validation(format!(
            "{location} names no agent and is not a HITL step"
        )));
    };
    if !spec.agents.contains_key(agent) {
        return Err(EngineError::Validation(format!(
            "{location} references undefined agent '{agent}'"
        )));
    }
    Ok(())
}

fn validate_graph(spec: &WorkflowSpec, config: &GraphConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(EngineError::Validation("graph has no nodes".to_string()));
    }
    for (id, node) in &config.nodes {
        if !node.is_hitl() {
            check_agent(spec, node.agent.as_deref(), &format!("node '{id}'"))?;
        }
    }
    for edge in &config.edges {
        if !config.nodes.contains_key(&edge.from) {
            return Err(EngineError::Validation(format!(
                "edge from unknown node '{}'",
                edge.from
            )));
        }
        if let Some(targets) = &edge.to {
            if targets.is_empty() {
                return Err(EngineError::Validation(format!(
                    "edge from '{}' has an empty target list",
                    edge.from
                )));
            }
            for target in targets {
                if !config.nodes.contains_key(target) {
                    return Err(EngineError::Validation(format!(
                        "edge from '{}' targets unknown node '{target}'",
                        edge.from
                    )));
                }
            }
        }
        if let Some(clauses) = &edge.choose {
            for clause in clauses {
                if !config.nodes.contains_key(&clause.to) {
                    return Err(EngineError::Validation(format!(
                        "edge from '{}' chooses unknown node '{}'",
                        edge.from, clause.to
                    )));
                }
            }
        }
        if edge.to.is_none() && edge.choose.is_none() {
            return Err(EngineError::Validation(format!(
                "edge from '{}' has neither 'to' nor 'choose'",
                edge.from
            )));
        }
    }
    Ok(())
}

/// Partition DAG tasks into executable layers.
///
/// A layer holds tasks whose dependencies all live in earlier layers.
/// Fails on unknown dependencies and on cycles.
pub fn dag_layers(config: &DagConfig) -> Result<Vec<Vec<String>>> {
    let by_id: HashMap<&str, &TaskDef> = config
        .tasks
        .iter()
        .map(|task| (task.id.as_str(), task))
        .collect();
    if by_id.len() != config.tasks.len() {
        return Err(EngineError::Validation("duplicate task id".to_string()));
    }

    for task in &config.tasks {
        for dep in &task.deps {
            if !by_id.contains_key(dep.as_str()) {
                return Err(EngineError::Validation(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
        }
    }

    let mut placed: HashSet<String> = HashSet::new();
    let mut layers: Vec<Vec<String>> = Vec::new();

    while placed.len() < config.tasks.len() {
        let mut layer: Vec<String> = Vec::new();
        for task in &config.tasks {
            if placed.contains(&task.id) {
                continue;
            }
            if task.deps.iter().all(|dep| placed.contains(dep)) {
                layer.push(task.id.clone());
            }
        }
        if layer.is_empty() {
            return Err(EngineError::Validation(
                "cycle detected in workflow task graph".to_string(),
            ));
        }
        placed.extend(layer.iter().cloned());
        layers.push(layer);
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_models::spec::{SpecFormat, WorkflowSpec};

    fn dag(tasks_yaml: &str) -> DagConfig {
        serde_yaml::from_str(&format!("tasks:\n{tasks_yaml}")).unwrap()
    }

    #[test]
    fn layers_partition_by_dependencies() {
        let config = dag(
            r#"
  - { id: a, agent: x, input: "" }
  - { id: b, agent: x, deps: [a], input: "" }
  - { id: c, agent: x, deps: [a], input: "" }
  - { id: d, agent: x, deps: [b, c], input: "" }
"#,
        );
        let layers = dag_layers(&config).unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()]
            ]
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let config = dag(
            r#"
  - { id: a, agent: x, deps: [b], input: "" }
  - { id: b, agent: x, deps: [a], input: "" }
"#,
        );
        let err = dag_layers(&config).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_deps_are_rejected() {
        let config = dag("  - { id: a, agent: x, deps: [ghost], input: \"\" }\n");
        let err = dag_layers(&config).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn undefined_agents_are_rejected() {
        let yaml = r#"
name: demo
pattern_type: chain
agents:
  known: { prompt: p }
pattern:
  config:
    steps:
      - { agent: ghost, input: "x" }
"#;
        let spec = WorkflowSpec::parse(yaml, SpecFormat::Yaml).unwrap();
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn graph_edges_must_target_known_nodes() {
        let yaml = r#"
name: g
pattern_type: graph
agents:
  a: { prompt: p }
pattern:
  config:
    nodes:
      start: { agent: a, input: "x" }
    edges:
      - { from: start, to: [ghost] }
"#;
        let spec = WorkflowSpec::parse(yaml, SpecFormat::Yaml).unwrap();
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn parallel_needs_two_branches() {
        let yaml = r#"
name: p
pattern_type: parallel
agents:
  a: { prompt: p }
pattern:
  config:
    branches:
      - { id: only, steps: [ { agent: a, input: "x" } ] }
"#;
        let spec = WorkflowSpec::parse(yaml, SpecFormat::Yaml).unwrap();
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("two branches"));
    }
}
