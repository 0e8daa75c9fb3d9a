//! Routing executor: route parsing robustness, reprompts, checkpointed
//! route choice.

mod common;

use indexmap::IndexMap;
use weave_ai::MockStep;
use weave_engine::ExecuteOptions;
use weave_models::session::PatternState;
use weave_models::EngineError;

use common::{engine_with_script, spec};

const SUPPORT_ROUTER: &str = r#"
name: support
pattern_type: routing
runtime: { provider: mock, model_id: mock-1 }
agents:
  router: { prompt: "You route tickets." }
  faq_bot: { prompt: "p" }
  billing_bot: { prompt: "p" }
pattern:
  config:
    router:
      agent: router
      input: "Route this ticket: {{ ticket }}"
      max_retries: 2
    routes:
      faq:
        then:
          - { agent: faq_bot, input: "answer from the FAQ: {{ ticket }}" }
      billing:
        then:
          - { agent: billing_bot, input: "open a billing case" }
inputs:
  values:
    ticket: "how do I reset my password"
"#;

#[tokio::test]
async fn json_route_reply_selects_the_route() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text(r#"{"route": "faq"}"#),
            MockStep::text("handled"),
        ],
    );

    let result = engine
        .execute(spec(SUPPORT_ROUTER), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.last_response.as_deref(), Some("handled"));
    assert_eq!(client.call_count(), 2);

    let session = engine
        .store()
        .load(result.session_id.unwrap())
        .unwrap()
        .unwrap();
    let PatternState::Routing(state) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.router_choice.as_deref(), Some("faq"));
    assert_eq!(state.routed.unwrap().step_history.len(), 1);
}

#[tokio::test]
async fn bare_token_reply_selects_the_route() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(
        dir.path(),
        vec![MockStep::text("faq\n"), MockStep::text("handled")],
    );

    let result = engine
        .execute(spec(SUPPORT_ROUTER), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();
    assert_eq!(result.last_response.as_deref(), Some("handled"));
}

#[tokio::test]
async fn invalid_replies_are_reprompted_then_fail() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("hmm, tricky"),
            MockStep::text("still thinking"),
            MockStep::text("no idea"),
        ],
    );

    let err = engine
        .execute(spec(SUPPORT_ROUTER), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Provider(_)));
    // Initial attempt plus max_retries reprompts.
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn reprompt_recovers_when_the_router_complies() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("let me think"),
            MockStep::text("billing"),
            MockStep::text("case opened"),
        ],
    );

    let result = engine
        .execute(spec(SUPPORT_ROUTER), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap();

    assert_eq!(result.last_response.as_deref(), Some("case opened"));
    assert_eq!(client.call_count(), 3);

    let session = engine
        .store()
        .load(result.session_id.unwrap())
        .unwrap()
        .unwrap();
    let PatternState::Routing(state) = session.pattern_state else {
        panic!("wrong state");
    };
    assert_eq!(state.router_choice.as_deref(), Some("billing"));
}

#[tokio::test]
async fn router_retries_count_against_max_steps() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _client) = engine_with_script(
        dir.path(),
        vec![
            MockStep::text("nope"),
            MockStep::text("still nope"),
            MockStep::text("faq"),
        ],
    );

    let yaml = SUPPORT_ROUTER.replace(
        "runtime: { provider: mock, model_id: mock-1 }",
        "runtime: { provider: mock, model_id: mock-1, budgets: { max_steps: 2 } }",
    );

    let err = engine
        .execute(spec(&yaml), IndexMap::new(), ExecuteOptions::persistent())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BudgetExceeded(_)));
}
