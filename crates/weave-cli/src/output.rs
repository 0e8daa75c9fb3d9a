//! Human-facing result rendering

use colored::Colorize;

use weave_models::session::SessionMetadata;
use weave_models::ExecutionResult;

pub fn print_result(result: &ExecutionResult) {
    if result.is_paused() {
        println!("{}", "⏸ paused for human input".yellow().bold());
        if let Some(session_id) = result.session_id {
            println!(
                "  resume with: {}",
                format!("weave resume {session_id} --hitl-response \"...\"").cyan()
            );
        }
        if let Some(prompt) = &result.last_response {
            println!("  prompt: {prompt}");
        }
        return;
    }

    println!("{}", "✔ workflow complete".green().bold());
    println!("  pattern: {}", result.pattern_type);
    println!("  tokens:  {}", result.cumulative_tokens);
    if let Some(session_id) = result.session_id {
        println!("  session: {session_id}");
    }
    if let Some(response) = &result.last_response {
        println!("\n{response}");
    }
}

pub fn print_session_table(sessions: &[SessionMetadata]) {
    use comfy_table::Table;

    let mut table = Table::new();
    table.set_header(vec!["session", "workflow", "pattern", "status", "updated"]);
    for meta in sessions {
        table.add_row(vec![
            meta.session_id.to_string(),
            meta.workflow_name.clone(),
            meta.pattern_type.to_string(),
            meta.status.to_string(),
            meta.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
}
