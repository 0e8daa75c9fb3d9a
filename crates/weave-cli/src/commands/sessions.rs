//! `weave sessions`: list, show, delete, cleanup.

use colored::Colorize;

use weave_engine::Engine;
use weave_models::error::{EngineError, Result};
use weave_models::session::SessionStatus;

use crate::cli::SessionCommands;
use crate::output;

fn parse_status(raw: &str) -> Result<SessionStatus> {
    match raw {
        "running" => Ok(SessionStatus::Running),
        "paused" => Ok(SessionStatus::Paused),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        other => Err(EngineError::Validation(format!(
            "unknown status '{other}' (expected running, paused, completed, failed)"
        ))),
    }
}

pub async fn run(engine: &Engine, command: SessionCommands) -> Result<i32> {
    match command {
        SessionCommands::List { status } => {
            let filter = status.as_deref().map(parse_status).transpose()?;
            let sessions = engine.store().list(filter).map_err(EngineError::from)?;
            if sessions.is_empty() {
                println!("no sessions");
            } else {
                output::print_session_table(&sessions);
            }
            Ok(0)
        }
        SessionCommands::Show { session_id } => {
            let session = engine
                .store()
                .load(session_id)
                .map_err(EngineError::from)?
                .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&session)
                    .map_err(|e| EngineError::Io(e.to_string()))?
            );
            Ok(0)
        }
        SessionCommands::Delete { session_id } => {
            if !engine.store().exists(session_id) {
                return Err(EngineError::NotFound(session_id.to_string()));
            }
            engine
                .store()
                .delete(session_id)
                .map_err(EngineError::from)?;
            println!("{} {session_id}", "deleted".red());
            Ok(0)
        }
        SessionCommands::Cleanup {
            max_age_days,
            keep_completed,
        } => {
            let removed = engine
                .store()
                .cleanup(chrono::Duration::days(max_age_days), keep_completed)
                .map_err(EngineError::from)?;
            println!("removed {removed} session(s)");
            Ok(0)
        }
    }
}
