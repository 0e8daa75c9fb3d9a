//! Shared fixtures: an engine over a temp session store wired to one
//! scripted mock client.

use std::sync::Arc;

use weave_ai::{MockClient, MockStep, ModelClient, ModelPool};
use weave_engine::Engine;
use weave_models::spec::{SpecFormat, WorkflowSpec};
use weave_storage::SessionStore;

/// Engine whose model pool always serves the given scripted client.
pub fn engine_with_script(
    root: &std::path::Path,
    steps: Vec<MockStep>,
) -> (Engine, Arc<MockClient>) {
    let client = Arc::new(MockClient::from_steps("mock-1", steps));
    let pool_client = client.clone();
    let pool = ModelPool::with_factory(Box::new(move |_key| {
        Ok(pool_client.clone() as Arc<dyn ModelClient>)
    }));
    let engine =
        Engine::new(SessionStore::new(root.join("sessions"))).with_pool(Arc::new(pool));
    (engine, client)
}

pub fn spec(yaml: &str) -> WorkflowSpec {
    WorkflowSpec::parse(yaml, SpecFormat::Yaml).expect("test spec parses")
}
