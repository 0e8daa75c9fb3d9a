//! `weave run`: execute a spec from the start.

use indexmap::IndexMap;
use serde_json::Value;

use weave_engine::{Engine, ExecuteOptions};
use weave_models::error::{EngineError, Result};
use weave_models::spec::WorkflowSpec;

use crate::cli::RunArgs;
use crate::commands::{hitl_handler, write_artifact};
use crate::output;

/// Parse repeated `--var key=value` flags. Values that parse as JSON
/// become structured values; everything else stays a string.
pub fn parse_vars(raw: &[String]) -> Result<IndexMap<String, Value>> {
    let mut vars = IndexMap::new();
    for pair in raw {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            EngineError::Validation(format!("--var must look like key=value, got '{pair}'"))
        })?;
        let parsed = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        vars.insert(key.to_string(), parsed);
    }
    Ok(vars)
}

pub async fn run(engine: &Engine, args: RunArgs) -> Result<i32> {
    let spec = WorkflowSpec::load(&args.spec)?;
    let variables = parse_vars(&args.vars)?;

    let options = ExecuteOptions {
        persist: !args.no_session,
        hitl_handler: hitl_handler(args.non_interactive),
        ..Default::default()
    };

    let result = engine.execute(spec, variables, options).await?;

    if let Some(path) = &args.output {
        if !result.is_paused() {
            write_artifact(engine, &result, path)?;
        }
    }

    output::print_result(&result);
    Ok(result.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_parse_strings_and_json() {
        let vars = parse_vars(&[
            "topic=birds".to_string(),
            "count=3".to_string(),
            "flags=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["topic"], Value::String("birds".into()));
        assert_eq!(vars["count"], serde_json::json!(3));
        assert_eq!(vars["flags"], serde_json::json!([1, 2]));
    }

    #[test]
    fn malformed_vars_are_rejected() {
        assert!(parse_vars(&["no-equals".to_string()]).is_err());
    }
}
