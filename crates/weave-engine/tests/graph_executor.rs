//! Graph executor: conditional routing, loop bounds, HITL nodes,
//! terminal-gate completion.

mod common;

use indexmap::IndexMap;
use weave_ai::MockStep;
use weave_engine::ExecuteOptions;
use weave_models::session::{NodeStatus, PatternState, SessionStatus};
use weave_models::EngineError;

use common::{engine_with_script, spec};

fn ticket_graph(max_iterations: u32) -> String {
    format!(
        r#"
name: s4
pattern_type: graph
runtime: {{ provider: mock, model_id: mock-1 }}
agents:
  triage: {{ prompt: "p" }}
  engineer: {{ prompt: "p" }}
  accountant: {{ prompt: "p" }}
  closer: {{ prompt: "p" }}
pattern:
  config:
    max_iterations: {max_iterations}
    nodes:
      intake: {{ agent: triage, input: "triage {{{{ ticket }}}}" }}
      tech: {{ agent: engineer, input: "debug round {{{{ nodes.tech.iteration | default(0) }}}}" }}
      billing: {{ agent: accountant, input: "refund" }}
      escalate: {{ agent: closer, input: "escalate" }}
      resolved: {{ agent: closer, input: "close out" }}
    edges:
      - from: intake
        choose:
          - {{ when: "nodes.intake.response == 'tech'", to: tech }}
          - {{ when: "nodes.intake.response == 'billing'", to: billing }}
          - {{ when: else, to: escalate }}
      - from: tech
        choose:
          - {{ when: "nodes.tech.iteration != 3", to: tech }}
          - {{ when: else, to: resolved }}
inputs:
  values: {{ ticket: "screen is blank" }}
"#
    )
}

#[tokio::test]
async fn conditional_edges_route_and_loop_until_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("tech"),
            MockStep::text("attempt-1"),
            MockStep::text("attempt-2"),
            MockStep::text("attempt-3"),
            MockStep::text("ticket closed"),
        ],
    );

    let result = engine
        .execute(
            spec(&ticket_graph(3)),
            IndexMap::new(),
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.last_response.as_deref(), Some("ticket closed"));
    assert_eq!(client.call_count(), 5);

    let session = engine
        .store()
        .load(result.session_id.unwrap())
        .unwrap()
        .unwrap();
    let PatternState::Graph(state) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(
        state.execution_path,
        vec!["intake", "tech", "tech", "tech", "resolved"]
    );
    assert_eq!(state.iteration_counts["tech"], 3);
    assert!(state.current_node.is_none());
}

#[tokio::test]
async fn iteration_cap_trips_after_exactly_max_visits() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("tech"),
            MockStep::text("attempt-1"),
            MockStep::text("attempt-2"),
        ],
    );

    let err = engine
        .execute(
            spec(&ticket_graph(2)),
            IndexMap::new(),
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::IterationLimit(_)));
    assert_eq!(err.exit_code(), 10);
    // intake + two tech visits; the third entry trips the cap.
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn else_branch_handles_unmatched_responses() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(
        dir.path(),
        vec![MockStep::text("no idea"), MockStep::text("escalated to a human")],
    );

    let result = engine
        .execute(
            spec(&ticket_graph(3)),
            IndexMap::new(),
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();
    assert_eq!(result.last_response.as_deref(), Some("escalated to a human"));
}

const REVIEW_GRAPH: &str = r#"
name: gated-graph
pattern_type: graph
runtime: { provider: mock, model_id: mock-1 }
agents:
  author: { prompt: "p" }
  publisher: { prompt: "p" }
pattern:
  config:
    nodes:
      draft: { agent: author, input: "draft {{ topic }}" }
      review: { type: hitl, prompt: "Approve the draft?", context_display: "{{ nodes.draft.response }}" }
      publish: { agent: publisher, input: "publish with note {{ nodes.review.response }}" }
    edges:
      - { from: draft, to: [review] }
      - from: review
        choose:
          - { when: "nodes.review.response != 'reject'", to: publish }
inputs:
  values: { topic: birds }
"#;

#[tokio::test]
async fn hitl_node_pauses_and_response_flows_into_conditions() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(dir.path(), vec![MockStep::text("the-draft")]);

    let paused = engine
        .execute(spec(REVIEW_GRAPH), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert!(paused.is_paused());
    assert_eq!(client.call_count(), 1);

    let session_id = paused.session_id.unwrap();
    let on_disk = engine.store().load(session_id).unwrap().unwrap();
    assert_eq!(on_disk.metadata.status, SessionStatus::Paused);
    let PatternState::Graph(state) = &on_disk.pattern_state else {
        panic!("wrong state");
    };
    let hitl = state.hitl_state.as_ref().unwrap();
    assert!(hitl.active);
    assert_eq!(hitl.node_id.as_deref(), Some("review"));
    assert_eq!(hitl.context_display.as_deref(), Some("the-draft"));
    // The pending gate is the next unit.
    assert_eq!(state.current_node.as_deref(), Some("review"));
    assert_eq!(
        state.node_results["review"].status,
        NodeStatus::WaitingForUser
    );

    let done = engine
        .resume(
            session_id,
            Some("approved".to_string()),
            None,
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();
    assert!(done.success);
    // Only publish ran after the resume.
    assert_eq!(client.call_count(), 2);
    assert!(done.last_response.unwrap().contains("approved"));

    let final_state = engine.store().load(session_id).unwrap().unwrap();
    let PatternState::Graph(state) = final_state.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.node_results["review"].response, "approved");
    assert_eq!(state.node_results["review"].status, NodeStatus::Success);
    assert_eq!(state.execution_path, vec!["draft", "review", "publish"]);
}

#[tokio::test]
async fn terminal_hitl_node_completes_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(dir.path(), vec![]);

    let yaml = r#"
name: signoff
pattern_type: graph
runtime: { provider: mock, model_id: mock-1 }
agents: {}
pattern:
  config:
    nodes:
      gate: { type: hitl, prompt: "Final sign-off?" }
    edges: []
"#;

    let paused = engine
        .execute(spec(yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert!(paused.is_paused());

    let done = engine
        .resume(
            paused.session_id.unwrap(),
            Some("signed".to_string()),
            None,
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();
    assert!(done.success);
    assert_eq!(done.last_response.as_deref(), Some("signed"));

    let session = engine
        .store()
        .load(paused.session_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.metadata.status, SessionStatus::Completed);
}

#[tokio::test]
async fn hitl_timeout_applies_the_default_response() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(dir.path(), vec![MockStep::text("the-draft")]);

    let yaml = REVIEW_GRAPH.replace(
        "review: { type: hitl, prompt: \"Approve the draft?\", context_display: \"{{ nodes.draft.response }}\" }",
        "review: { type: hitl, prompt: \"Approve?\", default: \"auto-approved\", timeout: 0 }",
    );

    let paused = engine
        .execute(spec(&yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert!(paused.is_paused());

    // Past the deadline with no response: the default applies.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let done = engine
        .resume(
            paused.session_id.unwrap(),
            None,
            None,
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();
    assert!(done.success);
    assert!(done.last_response.unwrap().contains("auto-approved"));
}

#[tokio::test]
async fn hitl_timeout_without_default_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(dir.path(), vec![MockStep::text("the-draft")]);

    let yaml = REVIEW_GRAPH.replace(
        "review: { type: hitl, prompt: \"Approve the draft?\", context_display: \"{{ nodes.draft.response }}\" }",
        "review: { type: hitl, prompt: \"Approve?\", timeout: 0 }",
    );

    let paused = engine
        .execute(spec(&yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    let session_id = paused.session_id.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let err = engine
        .resume(session_id, None, None, ExecuteOptions::persistent())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HitlTimeout(_)));

    let session = engine.store().load(session_id).unwrap().unwrap();
    assert_eq!(session.metadata.status, SessionStatus::Failed);
}
