//! Routing executor: a router agent picks a labeled route, then the
//! route's steps run as a chain sharing the session's checkpoint rules.
//!
//! The chosen route is checkpointed, so a resume replays the routed
//! steps without re-invoking the router.

use serde_json::{json, Value};

use weave_models::error::{EngineError, Result};
use weave_models::session::{ChainState, PatternState, SessionState};
use weave_models::spec::{PatternConfig, PatternType};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::chain::{inject_chain_response, run_steps, ChainSlot};
use crate::patterns::{state_mismatch, Outcome, ResumeMode};
use crate::template;

/// Parse the router's reply: either a JSON object `{"route": "<name>"}`
/// or a bare route token on its own line.
pub(crate) fn parse_route(response: &str, routes: &[&str]) -> Option<String> {
    let trimmed = response.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(route) = value.get("route").and_then(|r| r.as_str()) {
            if routes.contains(&route) {
                return Some(route.to_string());
            }
        }
    }

    for line in trimmed.lines() {
        let token = line
            .trim()
            .trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'));
        if routes.contains(&token) {
            return Some(token.to_string());
        }
    }
    None
}

pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::Routing(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::Routing));
    };
    let PatternState::Routing(existing) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::Routing));
    };
    let mut state = existing.clone();

    let route_names: Vec<&str> = config.routes.keys().map(|k| k.as_str()).collect();

    if state.router_choice.is_none() {
        let context = ctx.base_context(session);
        let mut prompt = template::render(&config.router.input, &context)?;

        let mut choice = None;
        for attempt in 0..=config.router.max_retries {
            let record = ctx
                .invoke(session, &config.router.agent, None, None, &prompt)
                .await?;
            if let Some(route) = parse_route(&record.text, &route_names) {
                choice = Some(route);
                break;
            }
            ctx.emit(
                session,
                EventKind::RetryAttempt,
                json!({
                    "agent": config.router.agent,
                    "attempt": attempt + 1,
                    "error": "router reply named no known route",
                }),
            );
            prompt = format!(
                "Your previous reply did not name a valid route. \
                 Reply with exactly one of: {}.",
                route_names.join(", ")
            );
        }

        let Some(choice) = choice else {
            return Err(EngineError::Provider(format!(
                "router failed to select a route from [{}] after {} retries",
                route_names.join(", "),
                config.router.max_retries
            )));
        };

        state.router_choice = Some(choice);
        state.routed = Some(ChainState::default());
        match &mut session.pattern_state {
            PatternState::Routing(slot) => *slot = state.clone(),
            _ => return Err(state_mismatch(PatternType::Routing)),
        }
        session.token_usage = ctx.meter.snapshot();
        ctx.save_session(session)?;
    }

    let choice = state
        .router_choice
        .clone()
        .ok_or_else(|| EngineError::Validation("router choice missing".to_string()))?;
    let route = config.routes.get(&choice).ok_or_else(|| {
        EngineError::Validation(format!("checkpointed route '{choice}' no longer exists"))
    })?;

    let mut chain = state.routed.clone().unwrap_or_default();
    if let Some(hitl) = chain.hitl_state.as_ref().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused at routed step {}",
                session.session_id(),
                hitl.step_index.unwrap_or(chain.current_step)
            )));
        };
        inject_chain_response(&mut chain, response);
        match &mut session.pattern_state {
            PatternState::Routing(slot) => slot.routed = Some(chain.clone()),
            _ => return Err(state_mismatch(PatternType::Routing)),
        }
        ctx.save_session(session)?;
    }

    run_steps(
        ctx,
        session,
        &route.then,
        chain,
        ChainSlot::Routing,
        json!({"router_choice": choice}),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &[&str] = &["faq", "billing", "escalate"];

    #[test]
    fn parses_json_route_objects() {
        assert_eq!(
            parse_route(r#"{"route": "faq"}"#, ROUTES),
            Some("faq".to_string())
        );
        assert_eq!(
            parse_route("  {\"route\":\"billing\"}  ", ROUTES),
            Some("billing".to_string())
        );
    }

    #[test]
    fn parses_bare_tokens_on_a_line() {
        assert_eq!(parse_route("faq", ROUTES), Some("faq".to_string()));
        assert_eq!(
            parse_route("I think:\nescalate\n", ROUTES),
            Some("escalate".to_string())
        );
        assert_eq!(parse_route("\"faq\"", ROUTES), Some("faq".to_string()));
    }

    #[test]
    fn rejects_unknown_routes() {
        assert_eq!(parse_route("unknown", ROUTES), None);
        assert_eq!(parse_route(r#"{"route": "nope"}"#, ROUTES), None);
        assert_eq!(parse_route("", ROUTES), None);
    }
}
