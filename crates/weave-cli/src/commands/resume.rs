//! `weave resume`: continue a paused or crashed session.

use weave_engine::{Engine, ExecuteOptions};
use weave_models::error::Result;
use weave_models::spec::WorkflowSpec;

use crate::cli::ResumeArgs;
use crate::commands::{hitl_handler, write_artifact};
use crate::output;

pub async fn run(engine: &Engine, args: ResumeArgs) -> Result<i32> {
    let current_spec = match &args.spec {
        Some(path) => Some(WorkflowSpec::load(path)?),
        None => None,
    };

    let options = ExecuteOptions {
        persist: true,
        hitl_handler: hitl_handler(args.non_interactive),
        ..Default::default()
    };

    let result = engine
        .resume(
            args.session_id,
            args.hitl_response.clone(),
            current_spec.as_ref(),
            options,
        )
        .await?;

    if let Some(path) = &args.output {
        if !result.is_paused() {
            write_artifact(engine, &result, path)?;
        }
    }

    output::print_result(&result);
    Ok(result.exit_code)
}
