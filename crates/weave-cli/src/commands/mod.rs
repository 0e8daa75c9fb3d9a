pub mod resume;
pub mod run;
pub mod sessions;

use std::io::Write;
use std::sync::Arc;

use colored::Colorize;

use weave_engine::HitlHandler;
use weave_models::session::HitlState;

/// Interactive HITL handler: show the gate on the terminal and block on
/// one line of stdin.
pub struct StdinHitlHandler;

impl HitlHandler for StdinHitlHandler {
    fn respond(&self, hitl: &HitlState) -> String {
        if let Some(display) = &hitl.context_display {
            println!("{}", display.dimmed());
        }
        print!("{} ", hitl.prompt.yellow().bold());
        if let Some(default) = &hitl.default_response {
            print!("[{default}] ");
        }
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            line.clear();
        }
        let answer = line.trim();
        if answer.is_empty() {
            hitl.default_response.clone().unwrap_or_default()
        } else {
            answer.to_string()
        }
    }
}

pub fn hitl_handler(non_interactive: bool) -> Option<Arc<dyn HitlHandler>> {
    if non_interactive {
        None
    } else {
        Some(Arc::new(StdinHitlHandler))
    }
}

/// Write the final response to a file and record it on the session.
pub fn write_artifact(
    engine: &weave_engine::Engine,
    result: &weave_models::ExecutionResult,
    path: &std::path::Path,
) -> weave_models::Result<()> {
    use weave_models::EngineError;

    let Some(response) = &result.last_response else {
        return Ok(());
    };
    std::fs::write(path, response)
        .map_err(|e| EngineError::Io(format!("failed to write {}: {e}", path.display())))?;

    if let Some(session_id) = result.session_id {
        if let Ok(Some(mut session)) = engine.store().load(session_id) {
            session
                .artifacts_written
                .push(path.display().to_string());
            if let Ok(Some((text, format))) = engine.store().load_spec_snapshot(session_id) {
                engine
                    .store()
                    .save(&session, &text, format)
                    .map_err(EngineError::from)?;
            }
        }
    }
    Ok(())
}
