//! Orchestrator-workers executor: multi-round planning, worker fan-out,
//! reduce and writeup synthesis, decomposition review.

mod common;

use indexmap::IndexMap;
use weave_ai::MockStep;
use weave_engine::ExecuteOptions;
use weave_models::session::{OrchestratorPhase, PatternState};

use common::{engine_with_script, spec};

const RESEARCH: &str = r#"
name: s6
pattern_type: orchestrator_workers
runtime:
  provider: mock
  model_id: mock-1
  max_parallel: 2
agents:
  planner: { prompt: "You decompose." }
  worker: { prompt: "You execute." }
  synth: { prompt: "You synthesize." }
pattern:
  config:
    orchestrator:
      agent: planner
      input: "break down: {{ goal }}"
      limits: { max_workers: 4, max_rounds: 2 }
    worker_template:
      agent: worker
    reduce:
      agent: synth
      input: "combine {{ workers }}"
    writeup:
      agent: synth
      input: "report on {{ reduce_response }}"
inputs:
  values: { goal: "market study" }
"#;

#[tokio::test]
async fn two_rounds_then_reduce_and_writeup() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text(r#"[{"description": "t1"}, {"description": "t2"}]"#),
            MockStep::text("w1").with_delay(10),
            MockStep::text("w2").with_delay(10),
            MockStep::text(r#"{"decision": "continue"}"#),
            MockStep::text(r#"[{"description": "t3"}]"#),
            MockStep::text("w3"),
            MockStep::text("combined"),
            MockStep::text("final report"),
        ],
    );

    let result = engine
        .execute(spec(RESEARCH), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.last_response.as_deref(), Some("final report"));
    // plan + 2 workers + decide + plan + worker + reduce + writeup.
    assert_eq!(client.call_count(), 8);
    // Workers within a round overlap, bounded by max_parallel.
    assert!(client.max_in_flight() <= 2);

    let session = engine
        .store()
        .load(result.session_id.unwrap())
        .unwrap()
        .unwrap();
    let PatternState::OrchestratorWorkers(state) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.phase, OrchestratorPhase::Done);
    assert_eq!(state.rounds.len(), 2);
    assert_eq!(state.rounds[0].plan.len(), 2);
    assert_eq!(state.rounds[0].worker_outputs.len(), 2);
    assert_eq!(state.rounds[1].plan.len(), 1);
    assert_eq!(state.reduce_output.as_deref(), Some("combined"));
    assert_eq!(state.writeup_output.as_deref(), Some("final report"));
}

#[tokio::test]
async fn round_cap_completes_implicitly() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text(r#"[{"description": "t1"}]"#),
            MockStep::text("w1"),
            MockStep::text(r#"{"decision": "continue"}"#),
            MockStep::text(r#"[{"description": "t2"}]"#),
            MockStep::text("w2"),
            // No decide call after the final round; reduce + writeup next.
            MockStep::text("combined"),
            MockStep::text("done"),
        ],
    );

    let result = engine
        .execute(spec(RESEARCH), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(client.call_count(), 7);
}

#[tokio::test]
async fn plan_length_is_clamped_to_max_workers() {
    let dir = tempfile::tempdir().unwrap();
    let many: Vec<String> = (0..8).map(|i| format!("{{\"description\": \"t{i}\"}}")).collect();
    let plan = format!("[{}]", many.join(","));
    let (engine, _client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text(plan),
            // Workers echo; decide completes.
        ],
    );

    let yaml = RESEARCH
        .replace("limits: { max_workers: 4, max_rounds: 2 }", "limits: { max_workers: 3, max_rounds: 1 }")
        .replace(
            "    reduce:\n      agent: synth\n      input: \"combine {{ workers }}\"\n    writeup:\n      agent: synth\n      input: \"report on {{ reduce_response }}\"\n",
            "",
        );

    let result = engine
        .execute(spec(&yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    let session = engine
        .store()
        .load(result.session_id.unwrap())
        .unwrap()
        .unwrap();
    let PatternState::OrchestratorWorkers(state) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.rounds[0].plan.len(), 3);
    assert_eq!(state.rounds[0].worker_outputs.len(), 3);
}

#[tokio::test]
async fn decomposition_review_can_replace_the_plan() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![MockStep::text(r#"[{"description": "boring task"}]"#)],
    );

    let yaml = RESEARCH.replace(
        "    worker_template:",
        "    decomposition_review: { prompt: \"Plan ok?\" }\n    worker_template:",
    );

    let paused = engine
        .execute(spec(&yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert!(paused.is_paused());
    assert_eq!(client.call_count(), 1);

    let session_id = paused.session_id.unwrap();
    let on_disk = engine.store().load(session_id).unwrap().unwrap();
    let PatternState::OrchestratorWorkers(state) = &on_disk.pattern_state else {
        panic!("wrong state");
    };
    let hitl = state.hitl_state.as_ref().unwrap();
    assert_eq!(hitl.gate.as_deref(), Some("decomposition_review"));
    assert_eq!(state.phase, OrchestratorPhase::Workers);

    // The reviewer swaps in an edited plan as raw JSON.
    client.push_step(MockStep::text("edited-done"));
    client.push_step(MockStep::text(r#"{"decision": "complete"}"#));
    client.push_step(MockStep::text("combined"));
    client.push_step(MockStep::text("report"));

    let done = engine
        .resume(
            session_id,
            Some(r#"[{"description": "sharper task"}]"#.to_string()),
            None,
            ExecuteOptions::persistent(),
        )
        .await
        .unwrap();
    assert!(done.success);

    let session = engine.store().load(session_id).unwrap().unwrap();
    let PatternState::OrchestratorWorkers(state) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.rounds[0].plan[0].description, "sharper task");
}
