//! Crash-recovery: a session rewound to an earlier checkpoint resumes
//! by invoking the provider only for units past that checkpoint.

mod common;

use indexmap::IndexMap;
use weave_ai::MockStep;
use weave_engine::ExecuteOptions;
use weave_models::session::{PatternState, SessionState, SessionStatus};
use weave_storage::SessionStore;

use common::{engine_with_script, spec};

/// Write a hand-rewound session back to disk, as if the process died
/// right after that checkpoint.
fn save_rewound(store: &SessionStore, session: &SessionState) {
    let (text, format) = store
        .load_spec_snapshot(session.session_id())
        .unwrap()
        .unwrap();
    store.save(session, &text, format).unwrap();
}

#[tokio::test]
async fn chain_resume_skips_completed_steps() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("step0"),
            MockStep::text("step1"),
            MockStep::text("step2"),
        ],
    );

    let yaml = r#"
name: crashy
pattern_type: chain
runtime: { provider: mock, model_id: mock-1 }
agents:
  a: { prompt: "p" }
pattern:
  config:
    steps:
      - { agent: a, input: "one" }
      - { agent: a, input: "two {{ steps[0].response }}" }
      - { agent: a, input: "three {{ steps[1].response }}" }
"#;

    let result = engine
        .execute(spec(yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert_eq!(client.call_count(), 3);
    let session_id = result.session_id.unwrap();

    // Rewind to the checkpoint taken after step 0.
    let mut session = engine.store().load(session_id).unwrap().unwrap();
    session.metadata.status = SessionStatus::Running;
    let PatternState::Chain(chain) = &mut session.pattern_state else {
        panic!("wrong state");
    };
    chain.step_history.truncate(1);
    chain.current_step = 1;
    save_rewound(engine.store(), &session);

    client.push_step(MockStep::text("step1b"));
    client.push_step(MockStep::text("step2b"));
    let resumed = engine
        .resume(session_id, None, None, ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(resumed.success);
    // Steps 1 and 2 only; step 0 was not re-executed.
    assert_eq!(client.call_count(), 5);
    assert_eq!(resumed.last_response.as_deref(), Some("step2b"));

    let final_state = engine.store().load(session_id).unwrap().unwrap();
    let PatternState::Chain(chain) = final_state.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(chain.step_history.len(), 3);
    assert_eq!(chain.step_history[0].response, "step0");
    assert_eq!(chain.step_history[1].response, "step1b");
}

#[tokio::test]
async fn workflow_resume_skips_completed_layers() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("ra"),
            MockStep::text("rb"),
            MockStep::text("rc"),
            MockStep::text("rd"),
        ],
    );

    let yaml = r#"
name: crashy-dag
pattern_type: workflow
runtime: { provider: mock, model_id: mock-1 }
agents:
  x: { prompt: "p" }
pattern:
  config:
    tasks:
      - { id: a, agent: x, input: "i" }
      - { id: b, agent: x, deps: [a], input: "i" }
      - { id: c, agent: x, deps: [a], input: "i" }
      - { id: d, agent: x, deps: [b, c], input: "i" }
"#;

    let result = engine
        .execute(spec(yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert_eq!(client.call_count(), 4);
    let session_id = result.session_id.unwrap();

    // Rewind to the checkpoint after layer 0: only `a` is complete and
    // current_layer already names the successor.
    let mut session = engine.store().load(session_id).unwrap().unwrap();
    session.metadata.status = SessionStatus::Running;
    let PatternState::Workflow(state) = &mut session.pattern_state else {
        panic!("wrong state");
    };
    state.completed_tasks.retain(|id| id == "a");
    state.task_outputs.retain(|id, _| id == "a");
    state.current_layer = 1;
    save_rewound(engine.store(), &session);

    let resumed = engine
        .resume(session_id, None, None, ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(resumed.success);
    // b, c and d re-ran; a did not.
    assert_eq!(client.call_count(), 7);

    let final_state = engine.store().load(session_id).unwrap().unwrap();
    let PatternState::Workflow(state) = final_state.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.completed_tasks.len(), 4);
    assert_eq!(state.task_outputs["a"].response, "ra");
    assert_eq!(state.current_layer, 3);
}

#[tokio::test]
async fn graph_resume_continues_from_the_checkpointed_node() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("planned"),
            MockStep::text("drafted"),
            MockStep::text("published"),
        ],
    );

    let yaml = r#"
name: crashy-graph
pattern_type: graph
runtime: { provider: mock, model_id: mock-1 }
agents:
  w: { prompt: "p" }
pattern:
  config:
    nodes:
      plan: { agent: w, input: "plan" }
      draft: { agent: w, input: "draft {{ nodes.plan.response }}" }
      publish: { agent: w, input: "publish {{ nodes.draft.response }}" }
    edges:
      - { from: plan, to: [draft] }
      - { from: draft, to: [publish] }
"#;

    let result = engine
        .execute(spec(yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert_eq!(client.call_count(), 3);
    let session_id = result.session_id.unwrap();

    // Rewind to the checkpoint after `plan`: current_node already names
    // the successor (`draft`).
    let mut session = engine.store().load(session_id).unwrap().unwrap();
    session.metadata.status = SessionStatus::Running;
    let PatternState::Graph(state) = &mut session.pattern_state else {
        panic!("wrong state");
    };
    state.current_node = Some("draft".to_string());
    state.node_results.retain(|id, _| id == "plan");
    state.iteration_counts.retain(|id, _| id == "plan");
    state.execution_path.truncate(1);
    state.total_steps = 1;
    save_rewound(engine.store(), &session);

    client.push_step(MockStep::text("drafted-again"));
    client.push_step(MockStep::text("published-again"));
    let resumed = engine
        .resume(session_id, None, None, ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(resumed.success);
    // plan was not re-invoked.
    assert_eq!(client.call_count(), 5);
    assert_eq!(resumed.last_response.as_deref(), Some("published-again"));

    let final_state = engine.store().load(session_id).unwrap().unwrap();
    let PatternState::Graph(state) = final_state.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.node_results["plan"].response, "planned");
    assert_eq!(state.execution_path, vec!["plan", "draft", "publish"]);
}

#[tokio::test]
async fn conversation_logs_survive_resume() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(dir.path(), vec![MockStep::text("draft")]);

    let yaml = r#"
name: conversational
pattern_type: chain
runtime: { provider: mock, model_id: mock-1 }
agents:
  a: { prompt: "p" }
pattern:
  config:
    steps:
      - { agent: a, input: "one" }
      - { type: hitl, prompt: "go on?" }
      - { agent: a, input: "two" }
"#;

    let paused = engine
        .execute(spec(yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    let session_id = paused.session_id.unwrap();

    let agents_dir = engine.store().agents_dir(session_id).unwrap();
    let log_path = agents_dir.join("a").join("conversation.json");
    assert!(log_path.exists());
    let before = std::fs::read_to_string(&log_path).unwrap();
    assert!(before.contains("draft"));

    engine
        .resume(
            session_id,
            Some("yes".to_string()),
            None,
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();

    // The resumed invocation appended to the same log.
    let after = std::fs::read_to_string(&log_path).unwrap();
    assert!(after.contains("draft"));
    assert!(after.len() > before.len());
}
