//! Template rendering over a JSON context.
//!
//! Supports `{{ path }}` substitution with dotted and indexed access
//! (`steps[0].response`, `tasks.extract.response`), the filters
//! `default`, `lower`, `upper` and `int`, and condition evaluation for
//! `when` clauses (where the literal `else` is always true and missing
//! paths resolve to the empty string instead of failing).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use weave_models::error::{EngineError, Result};

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("placeholder regex"));

/// How unresolvable paths are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingPolicy {
    /// Fail with `TemplateError`.
    Strict,
    /// Resolve to the empty string (used inside `when` clauses).
    Empty,
}

/// Render a template strictly: missing variables are an error.
pub fn render(template: &str, context: &Value) -> Result<String> {
    render_with(template, context, MissingPolicy::Strict)
}

/// Render a template permissively: missing variables become "".
pub fn render_permissive(template: &str, context: &Value) -> Result<String> {
    render_with(template, context, MissingPolicy::Empty)
}

fn render_with(template: &str, context: &Value, missing: MissingPolicy) -> Result<String> {
    check_balanced(template)?;

    let mut output = String::with_capacity(template.len());
    let mut cursor = 0usize;
    for captures in PLACEHOLDER_REGEX.captures_iter(template) {
        let whole = captures.get(0).expect("match");
        output.push_str(&template[cursor..whole.start()]);
        let expression = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        output.push_str(&eval_expression(expression, context, missing)?);
        cursor = whole.end();
    }
    output.push_str(&template[cursor..]);
    Ok(output)
}

/// Parse errors are reported before any resolution happens.
fn check_balanced(template: &str) -> Result<()> {
    let opens = template.matches("{{").count();
    let closes = template.matches("}}").count();
    let resolved = PLACEHOLDER_REGEX.find_iter(template).count();
    if opens != closes || opens != resolved {
        return Err(EngineError::Template(format!(
            "unbalanced placeholder braces in template: {template}"
        )));
    }
    Ok(())
}

/// Evaluate `path | filter | filter(arg)`.
fn eval_expression(expression: &str, context: &Value, missing: MissingPolicy) -> Result<String> {
    let mut parts = split_outside_quotes(expression, '|');
    if parts.is_empty() {
        return Err(EngineError::Template("empty placeholder".to_string()));
    }
    let path = parts.remove(0);
    let path = path.trim();

    let mut value = match resolve_path(context, path) {
        Some(value) => value,
        None => match missing {
            MissingPolicy::Strict => {
                // `default` may still rescue a missing value.
                if parts.iter().any(|f| f.trim().starts_with("default")) {
                    Value::Null
                } else {
                    return Err(EngineError::Template(format!(
                        "unknown variable '{path}'"
                    )));
                }
            }
            MissingPolicy::Empty => Value::Null,
        },
    };

    for filter in parts {
        value = apply_filter(filter.trim(), value)?;
    }

    Ok(value_to_string(&value))
}

fn apply_filter(filter: &str, value: Value) -> Result<Value> {
    let (name, arg) = match filter.find('(') {
        Some(open) => {
            let close = filter.rfind(')').ok_or_else(|| {
                EngineError::Template(format!("unterminated filter call: {filter}"))
            })?;
            (
                filter[..open].trim(),
                Some(filter[open + 1..close].trim().to_string()),
            )
        }
        None => (filter, None),
    };

    match name {
        "default" => {
            let fallback = arg.unwrap_or_default();
            let fallback = unquote(&fallback);
            let is_empty = matches!(&value, Value::Null)
                || matches!(&value, Value::String(s) if s.is_empty());
            if is_empty {
                Ok(Value::String(fallback))
            } else {
                Ok(value)
            }
        }
        "lower" => Ok(Value::String(value_to_string(&value).to_lowercase())),
        "upper" => Ok(Value::String(value_to_string(&value).to_uppercase())),
        "int" => {
            let parsed = match &value {
                Value::Number(n) => n.as_f64().map(|f| f.trunc() as i64),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .map(|f| f.trunc() as i64),
                Value::Bool(b) => Some(i64::from(*b)),
                _ => None,
            };
            match parsed {
                Some(n) => Ok(Value::Number(n.into())),
                None => Err(EngineError::Template(format!(
                    "cannot convert {value} to int"
                ))),
            }
        }
        other => Err(EngineError::Template(format!("unknown filter '{other}'"))),
    }
}

/// Resolve a dotted/indexed path like `tasks.extract.response` or
/// `steps[0].response` against the context.
fn resolve_path(context: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = context;
    for segment in path.split('.') {
        let (name, indexes) = parse_segment(segment)?;
        if !name.is_empty() {
            current = current.as_object()?.get(name)?;
        }
        for index in indexes {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current.clone())
}

/// Split `steps[0][1]` into `("steps", [0, 1])`.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let segment = segment.trim();
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(open) => {
            let name = &segment[..open];
            let mut indexes = Vec::new();
            let mut rest = &segment[open..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                indexes.push(stripped[..close].trim().parse().ok()?);
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
            Some((name, indexes))
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')))
    {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_string()
    }
}

fn split_outside_quotes(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in input.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == separator => {
                parts.push(current.clone());
                current.clear();
            }
            None => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Evaluate a `when` condition.
///
/// Grammar: the literal `else` (always true); `a == b` / `a != b` where
/// each operand is a quoted literal, a number, a `{{ ... }}` template,
/// or a context path; or a single operand tested for truthiness. Missing
/// paths resolve to the empty string (never an error).
pub fn eval_condition(condition: &str, context: &Value) -> Result<bool> {
    let condition = condition.trim();
    if condition == "else" {
        return Ok(true);
    }

    for (operator, negate) in [("==", false), ("!=", true)] {
        if let Some((lhs, rhs)) = split_comparison(condition, operator) {
            let left = resolve_operand(&lhs, context)?;
            let right = resolve_operand(&rhs, context)?;
            let equal = compare(&left, &right);
            return Ok(if negate { !equal } else { equal });
        }
    }

    let value = resolve_operand(condition, context)?;
    Ok(truthy(&value))
}

fn split_comparison(condition: &str, operator: &str) -> Option<(String, String)> {
    let mut quote: Option<char> = None;
    let bytes: Vec<char> = condition.chars().collect();
    let op: Vec<char> = operator.chars().collect();
    let mut i = 0;
    while i + op.len() <= bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                if bytes[i..i + op.len()] == op[..] {
                    let lhs: String = bytes[..i].iter().collect();
                    let rhs: String = bytes[i + op.len()..].iter().collect();
                    return Some((lhs.trim().to_string(), rhs.trim().to_string()));
                }
            }
        }
        i += 1;
    }
    None
}

/// Resolve one condition operand to a comparable string.
fn resolve_operand(operand: &str, context: &Value) -> Result<String> {
    let operand = operand.trim();
    if operand.is_empty() {
        return Ok(String::new());
    }
    // Quoted literal.
    if (operand.starts_with('\'') && operand.ends_with('\'') && operand.len() >= 2)
        || (operand.starts_with('"') && operand.ends_with('"') && operand.len() >= 2)
    {
        return Ok(unquote(operand));
    }
    // Embedded template.
    if operand.contains("{{") {
        return render_permissive(operand, context);
    }
    // Numeric literal.
    if operand.parse::<f64>().is_ok() {
        return Ok(operand.to_string());
    }
    // Context path; bare words that do not resolve are literal tokens
    // unless they look like a path.
    match resolve_path(context, operand) {
        Some(value) => Ok(value_to_string(&value)),
        None if operand.contains('.') || operand.contains('[') => Ok(String::new()),
        None => Ok(operand.to_string()),
    }
}

fn compare(left: &str, right: &str) -> bool {
    if let (Ok(a), Ok(b)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return (a - b).abs() < f64::EPSILON;
    }
    left == right
}

fn truthy(rendered: &str) -> bool {
    !matches!(rendered.trim(), "" | "false" | "0" | "null")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "topic": "birds",
            "count": 3,
            "steps": [
                {"response": "step0", "agent": "a"},
                {"response": "step1", "agent": "b"}
            ],
            "tasks": {
                "extract": {"response": "extracted", "tokens": 10}
            },
            "branches": {
                "web": {"response": "web"},
                "docs": {"response": "docs"}
            },
            "nodes": {
                "review": {"response": "LGTM", "iteration": 2}
            },
            "flag": true,
            "empty": ""
        })
    }

    #[test]
    fn substitutes_simple_variables() {
        assert_eq!(render("intro for {{ topic }}", &ctx()).unwrap(), "intro for birds");
        assert_eq!(render("{{count}} items", &ctx()).unwrap(), "3 items");
    }

    #[test]
    fn dotted_and_indexed_access() {
        let c = ctx();
        assert_eq!(render("{{ steps[0].response }}", &c).unwrap(), "step0");
        assert_eq!(render("{{ steps[1].response }}", &c).unwrap(), "step1");
        assert_eq!(render("{{ tasks.extract.response }}", &c).unwrap(), "extracted");
        assert_eq!(render("{{ branches.web.response }}", &c).unwrap(), "web");
        assert_eq!(render("{{ nodes.review.iteration }}", &c).unwrap(), "2");
    }

    #[test]
    fn filters_apply_in_order() {
        let c = ctx();
        assert_eq!(render("{{ topic | upper }}", &c).unwrap(), "BIRDS");
        assert_eq!(render("{{ topic | upper | lower }}", &c).unwrap(), "birds");
        assert_eq!(render("{{ missing | default('fallback') }}", &c).unwrap(), "fallback");
        assert_eq!(render("{{ empty | default(\"x\") }}", &c).unwrap(), "x");
        assert_eq!(render("{{ count | int }}", &c).unwrap(), "3");
        assert_eq!(
            render("{{ nodes.review.iteration | int }}", &c).unwrap(),
            "2"
        );
    }

    #[test]
    fn missing_variable_is_an_error_outside_when() {
        let err = render("{{ nope }}", &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
        let err = render("{{ steps[9].response }}", &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn unbalanced_braces_fail_at_parse() {
        assert!(render("{{ topic", &ctx()).is_err());
        assert!(render("hello {{", &ctx()).is_err());
        assert!(render("{{ a }} {{ b", &ctx()).is_err());
    }

    #[test]
    fn unknown_filter_is_an_error() {
        let err = render("{{ topic | shout }}", &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn permissive_mode_blanks_missing_paths() {
        assert_eq!(render_permissive("{{ nope }}", &ctx()).unwrap(), "");
        assert_eq!(
            render_permissive("-{{ nodes.missing.response }}-", &ctx()).unwrap(),
            "--"
        );
    }

    #[test]
    fn conditions_compare_paths_and_literals() {
        let c = ctx();
        assert!(eval_condition("topic == 'birds'", &c).unwrap());
        assert!(!eval_condition("topic == 'fish'", &c).unwrap());
        assert!(eval_condition("topic != 'fish'", &c).unwrap());
        assert!(eval_condition("nodes.review.response == 'LGTM'", &c).unwrap());
        assert!(eval_condition("nodes.review.iteration == 2", &c).unwrap());
        assert!(eval_condition("{{ nodes.review.response }} == 'LGTM'", &c).unwrap());
    }

    #[test]
    fn else_is_unconditionally_true() {
        assert!(eval_condition("else", &ctx()).unwrap());
        assert!(eval_condition("  else  ", &ctx()).unwrap());
    }

    #[test]
    fn truthiness_of_single_operands() {
        let c = ctx();
        assert!(eval_condition("flag", &c).unwrap());
        assert!(eval_condition("topic", &c).unwrap());
        assert!(!eval_condition("empty", &c).unwrap());
        // Missing paths are permissively empty, hence falsy.
        assert!(!eval_condition("nodes.ghost.response", &c).unwrap());
    }

    #[test]
    fn objects_render_as_json() {
        let rendered = render("{{ tasks.extract }}", &ctx()).unwrap();
        assert!(rendered.contains("\"response\""));
    }
}
