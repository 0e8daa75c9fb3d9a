//! Chain executor: sequencing, HITL pause/resume, cache and pool
//! singularity, budget enforcement.

mod common;

use std::sync::Arc;

use indexmap::IndexMap;
use weave_ai::{AgentCache, MockStep};
use weave_engine::{EventBus, ExecuteOptions};
use weave_models::session::{PatternState, SessionStatus};
use weave_models::{EngineError, EventKind};

use common::{engine_with_script, spec};

const THREE_STEP_CHAIN: &str = r#"
name: s1
pattern_type: chain
runtime:
  provider: mock
  model_id: mock-1
agents:
  a: { prompt: "You write intros." }
  b: { prompt: "You expand." }
  c: { prompt: "You conclude." }
pattern:
  config:
    steps:
      - { agent: a, input: "intro for {{ topic }}" }
      - { agent: b, input: "expand {{ steps[0].response }}" }
      - { agent: c, input: "conclude {{ steps[1].response }}" }
inputs:
  values:
    topic: birds
"#;

#[tokio::test]
async fn three_step_chain_threads_context() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("step0"),
            MockStep::text("step1"),
            MockStep::text("step2"),
        ],
    );

    let result = engine
        .execute(spec(THREE_STEP_CHAIN), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.last_response.as_deref(), Some("step2"));
    assert_eq!(client.call_count(), 3);

    let session = engine
        .store()
        .load(result.session_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.metadata.status, SessionStatus::Completed);
    let PatternState::Chain(chain) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(chain.step_history.len(), 3);
    assert_eq!(chain.current_step, 3);
}

#[tokio::test]
async fn agent_and_model_are_built_once_across_steps() {
    let dir = tempfile::tempdir().unwrap();
    let steps = (0..10).map(|i| MockStep::text(format!("r{i}"))).collect();
    let (engine, _client) = engine_with_script(dir.path(), steps);

    let yaml = r#"
name: reuse
pattern_type: chain
runtime: { provider: mock, model_id: mock-1 }
agents:
  only: { prompt: "One agent." }
pattern:
  config:
    steps:
      - { agent: only, input: "s0" }
      - { agent: only, input: "s1" }
      - { agent: only, input: "s2" }
      - { agent: only, input: "s3" }
      - { agent: only, input: "s4" }
      - { agent: only, input: "s5" }
      - { agent: only, input: "s6" }
      - { agent: only, input: "s7" }
      - { agent: only, input: "s8" }
      - { agent: only, input: "s9" }
"#;

    let cache = Arc::new(AgentCache::new());
    let options = ExecuteOptions {
        persist: true,
        agent_cache: Some(cache.clone()),
        ..Default::default()
    };
    let result = engine.execute(spec(yaml), IndexMap::new(), options).await.unwrap();

    assert!(result.success);
    // One (agent_id, overrides) key, one build; one runtime config, one client.
    assert_eq!(cache.build_count(), 1);
    assert!(!cache.is_closed(), "caller-supplied cache must stay open");
}

#[tokio::test]
async fn model_factory_runs_once_for_identical_runtime_configs() {
    use weave_ai::{MockClient, ModelClient, ModelPool};
    use weave_storage::SessionStore;

    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MockClient::new("mock-1"));
    let factory_client = client.clone();
    let pool = Arc::new(ModelPool::with_factory(Box::new(move |_key| {
        Ok(factory_client.clone() as Arc<dyn ModelClient>)
    })));
    let engine = weave_engine::Engine::new(SessionStore::new(dir.path().join("sessions")))
        .with_pool(pool.clone());

    let steps: String = (0..10)
        .map(|i| format!("      - {{ agent: only, input: \"s{i}\" }}\n"))
        .collect();
    let yaml = format!(
        "name: pooled\npattern_type: chain\nruntime: {{ provider: mock, model_id: mock-1 }}\n\
         agents:\n  only: {{ prompt: \"p\" }}\npattern:\n  config:\n    steps:\n{steps}"
    );

    let result = engine
        .execute(spec(&yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(client.call_count(), 10);
    assert_eq!(pool.build_count(), 1);
}

#[tokio::test]
async fn budget_exceeded_halts_with_history_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("small").with_tokens(10, 10),
            MockStep::text("big").with_tokens(60, 60),
            MockStep::text("never-reached"),
        ],
    );

    let yaml = r#"
name: budgeted
pattern_type: chain
runtime:
  provider: mock
  model_id: mock-1
  budgets: { max_tokens: 100 }
agents:
  a: { prompt: "p" }
pattern:
  config:
    steps:
      - { agent: a, input: "one" }
      - { agent: a, input: "two" }
      - { agent: a, input: "three" }
"#;

    let err = engine
        .execute(spec(yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::BudgetExceeded(_)));
    assert_eq!(err.exit_code(), 19);
    // The crossing invocation happened, the third never did.
    assert_eq!(client.call_count(), 2);

    let sessions = engine.store().list(None).unwrap();
    assert_eq!(sessions.len(), 1);
    let session = engine.store().load(sessions[0].session_id).unwrap().unwrap();
    assert_eq!(session.metadata.status, SessionStatus::Failed);
    assert!(session
        .metadata
        .error
        .as_deref()
        .unwrap()
        .starts_with("budget_exceeded:"));
    // Step history from before the breach survives.
    let PatternState::Chain(chain) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(chain.step_history.len(), 1);
    assert_eq!(chain.step_history[0].response, "small");
}

const HITL_CHAIN: &str = r#"
name: s5
pattern_type: chain
runtime: { provider: mock, model_id: mock-1 }
agents:
  a: { prompt: "p" }
  b: { prompt: "p" }
pattern:
  config:
    steps:
      - { agent: a, input: "draft {{ topic }}" }
      - { type: hitl, prompt: "Approve the draft?", context_display: "{{ steps[0].response }}" }
      - { agent: b, input: "publish {{ hitl_response }}" }
inputs:
  values: { topic: birds }
"#;

#[tokio::test]
async fn hitl_pause_checkpoints_then_resume_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(dir.path(), vec![MockStep::text("draft-v1")]);

    // Run 1: non-interactive, pauses at the gate.
    let paused = engine
        .execute(spec(HITL_CHAIN), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert!(paused.is_paused());
    assert_eq!(paused.agent_id.as_deref(), Some("hitl"));
    assert_eq!(client.call_count(), 1);

    let session_id = paused.session_id.unwrap();
    let on_disk = engine.store().load(session_id).unwrap().unwrap();
    assert_eq!(on_disk.metadata.status, SessionStatus::Paused);
    let PatternState::Chain(chain) = &on_disk.pattern_state else {
        panic!("wrong state");
    };
    // Crash-safety: current_step names the gate (the next unit), and the
    // locator matches.
    assert_eq!(chain.current_step, 1);
    let hitl = chain.hitl_state.as_ref().unwrap();
    assert!(hitl.active);
    assert_eq!(hitl.step_index, Some(1));
    assert_eq!(hitl.context_display.as_deref(), Some("draft-v1"));

    // Run 2: the response is observable downstream, and only the
    // remaining step invokes the provider.
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
    assert_eq!(client.call_count(), 2);
    assert!(done.last_response.unwrap().contains("approved"));

    let final_state = engine.store().load(session_id).unwrap().unwrap();
    assert_eq!(final_state.metadata.status, SessionStatus::Completed);
    let PatternState::Chain(chain) = final_state.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(chain.step_history.len(), 3);
    assert_eq!(chain.step_history[1].agent, "hitl");
    assert_eq!(chain.step_history[1].response, "approved");
}

#[tokio::test]
async fn interactive_handler_answers_inline() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(dir.path(), vec![MockStep::text("draft-v1")]);

    let options = ExecuteOptions {
        persist: true,
        hitl_handler: Some(Arc::new(|hitl: &weave_models::HitlState| {
            assert!(hitl.prompt.contains("Approve"));
            "ship it".to_string()
        })),
        ..Default::default()
    };
    let result = engine
        .execute(spec(HITL_CHAIN), IndexMap::new(), options)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(client.call_count(), 2);
    assert!(result.last_response.unwrap().contains("ship it"));
}

#[tokio::test]
async fn resume_without_response_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(dir.path(), vec![MockStep::text("draft")]);

    let paused = engine
        .execute(spec(HITL_CHAIN), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    let session_id = paused.session_id.unwrap();

    let err = engine
        .resume(session_id, None, None, ExecuteOptions::persistent())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WaitingForHitl(_)));

    // The session is still resumable afterwards.
    let on_disk = engine.store().load(session_id).unwrap().unwrap();
    assert_eq!(on_disk.metadata.status, SessionStatus::Paused);
}

#[tokio::test]
async fn completed_sessions_refuse_resume() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(
        dir.path(),
        vec![MockStep::text("a"), MockStep::text("b"), MockStep::text("c")],
    );

    let result = engine
        .execute(spec(THREE_STEP_CHAIN), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    let session_id = result.session_id.unwrap();

    let err = engine
        .resume(session_id, None, None, ExecuteOptions::persistent())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCompleted(_)));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn unknown_session_resume_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(dir.path(), vec![]);
    let err = engine
        .resume(uuid::Uuid::new_v4(), None, None, ExecuteOptions::persistent())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![MockStep::text("a"), MockStep::text("b"), MockStep::text("c")],
    );

    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).unwrap();

    let options = ExecuteOptions {
        persist: true,
        cancel: Some(rx),
        ..Default::default()
    };
    let err = engine
        .execute(spec(THREE_STEP_CHAIN), IndexMap::new(), options)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    // No new units were dispatched after the signal.
    assert_eq!(client.call_count(), 0);

    let sessions = engine.store().list(None).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    let session = engine.store().load(sessions[0].session_id).unwrap().unwrap();
    assert_eq!(session.metadata.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn events_bracket_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(
        dir.path(),
        vec![MockStep::text("a"), MockStep::text("b"), MockStep::text("c")],
    );

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut bus = EventBus::new();
    bus.subscribe(move |event: &weave_models::WorkflowEvent| {
        sink.lock().push(event.kind);
        Ok(())
    });

    let options = ExecuteOptions {
        persist: true,
        event_bus: Some(bus),
        ..Default::default()
    };
    engine
        .execute(spec(THREE_STEP_CHAIN), IndexMap::new(), options)
        .await
        .unwrap();

    let kinds = seen.lock().clone();
    assert_eq!(kinds.first(), Some(&EventKind::WorkflowStart));
    assert_eq!(kinds.last(), Some(&EventKind::WorkflowComplete));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::StepComplete)
            .count(),
        3
    );
}
