//! Reference expressions and boolean predicates.
//!
//! Reference expressions are the `${path}` syntax used in node input
//! mappings: `${name}` reads a variable (falling back to the initial
//! inputs), `${input.path}` reads the initial inputs, and
//! `${node.path.parts}` reads a prior node's captured output, walking one
//! map key per part. Anything that does not resolve yields `None` (absent,
//! not an error) so optional inputs stay optional.
//!
//! Predicates are deliberately small: a single comparison
//! (`==`, `!=`, `>=`, `<=`, `>`, `<`) between two tokens, or the
//! truthiness of one token. There is no general expression language.

use crate::context::ExecutionContext;
use crate::node::NodeId;
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Head segment reserved for the execution's initial inputs.
const INPUT_ROOT: &str = "input";

/// Returns true if the string is a whole-string reference expression.
#[must_use]
pub fn is_reference(expr: &str) -> bool {
    expr.starts_with("${") && expr.ends_with('}') && expr.len() > 3
}

/// Resolves a reference expression against an execution context.
///
/// Non-reference strings are returned unchanged as string values; references
/// that do not resolve return `None`.
#[must_use]
pub fn resolve_input_value(expr: &str, context: &ExecutionContext) -> Option<JsonValue> {
    if is_reference(expr) {
        resolve_reference(expr, context)
    } else {
        Some(JsonValue::String(expr.to_string()))
    }
}

/// Resolves a `${path}` reference against an execution context.
#[must_use]
pub fn resolve_reference(expr: &str, context: &ExecutionContext) -> Option<JsonValue> {
    if !is_reference(expr) {
        return None;
    }
    let path = &expr[2..expr.len() - 1];
    let mut parts = path.split('.');
    let head = parts.next()?;
    if head.is_empty() {
        return None;
    }
    let rest: Vec<&str> = parts.collect();

    if rest.is_empty() {
        // Variable lookup, falling back to the initial inputs.
        return context
            .variable(head)
            .or_else(|| context.input(head))
            .cloned();
    }

    if head == INPUT_ROOT {
        let value = context.input(rest[0])?;
        return walk(value, &rest[1..]).cloned();
    }

    let output = context.node_output(&NodeId::new(head))?;
    let value = output.get(rest[0])?;
    walk(value, &rest[1..]).cloned()
}

/// Walks map keys one part at a time; a missing intermediate yields `None`.
fn walk<'a>(mut value: &'a JsonValue, parts: &[&str]) -> Option<&'a JsonValue> {
    for part in parts {
        value = value.as_object()?.get(*part)?;
    }
    Some(value)
}

/// Evaluates a predicate against an execution context.
///
/// `${ref}` tokens resolve through [`resolve_reference`]; bare identifiers
/// resolve as variables first, then literals.
#[must_use]
pub fn evaluate_predicate(condition: &str, context: &ExecutionContext) -> bool {
    evaluate_with(condition, &|token| {
        if is_reference(token) {
            resolve_reference(token, context)
        } else {
            context
                .variable(token)
                .or_else(|| context.input(token))
                .cloned()
        }
    })
}

/// Evaluates a predicate against a flat variable map (state machine guards).
#[must_use]
pub fn evaluate_predicate_vars(condition: &str, variables: &JsonMap<String, JsonValue>) -> bool {
    evaluate_with(condition, &|token| {
        if let Some(name) = token.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
            variables.get(name).cloned()
        } else {
            variables.get(token).cloned()
        }
    })
}

fn evaluate_with(condition: &str, resolve: &dyn Fn(&str) -> Option<JsonValue>) -> bool {
    let condition = condition.trim();
    if condition.is_empty() {
        return true;
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some((lhs, rhs)) = condition.split_once(op) {
            let lhs = token_value(lhs.trim(), resolve);
            let rhs = token_value(rhs.trim(), resolve);
            return compare(op, lhs, rhs);
        }
    }

    is_truthy(token_value(condition, resolve))
}

/// Resolves a token: resolver hit first, then literal.
fn token_value(token: &str, resolve: &dyn Fn(&str) -> Option<JsonValue>) -> Option<JsonValue> {
    if let Some(value) = resolve(token) {
        return Some(value);
    }
    if token.starts_with("${") {
        return None;
    }
    Some(parse_literal(token))
}

fn parse_literal(token: &str) -> JsonValue {
    match token {
        "true" => JsonValue::Bool(true),
        "false" => JsonValue::Bool(false),
        "null" => JsonValue::Null,
        _ => {
            if let Some(stripped) = strip_quotes(token) {
                return JsonValue::String(stripped.to_string());
            }
            if let Ok(n) = token.parse::<i64>() {
                return JsonValue::Number(n.into());
            }
            if let Ok(f) = token.parse::<f64>()
                && let Some(n) = serde_json::Number::from_f64(f)
            {
                return JsonValue::Number(n);
            }
            JsonValue::String(token.to_string())
        }
    }
}

fn strip_quotes(token: &str) -> Option<&str> {
    let token = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\''));
    if token.is_some() {
        return token;
    }
    None
}

fn compare(op: &str, lhs: Option<JsonValue>, rhs: Option<JsonValue>) -> bool {
    match op {
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        _ => {
            let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                return false;
            };
            if let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) {
                return match op {
                    ">=" => l >= r,
                    "<=" => l <= r,
                    ">" => l > r,
                    "<" => l < r,
                    _ => false,
                };
            }
            if let (Some(l), Some(r)) = (lhs.as_str(), rhs.as_str()) {
                return match op {
                    ">=" => l >= r,
                    "<=" => l <= r,
                    ">" => l > r,
                    "<" => l < r,
                    _ => false,
                };
            }
            false
        }
    }
}

fn is_truthy(value: Option<JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(JsonValue::String(s)) => !s.is_empty() && s != "false",
        Some(JsonValue::Array(a)) => !a.is_empty(),
        Some(JsonValue::Object(o)) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::ExecutionId;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut inputs = JsonMap::new();
        inputs.insert("m".to_string(), json!("hi"));
        inputs.insert("nested".to_string(), json!({"inner": 5}));
        let mut ctx = ExecutionContext::new("wf", ExecutionId::new(), inputs);
        ctx.set_variable("count", json!(3));
        let mut output = JsonMap::new();
        output.insert("msg".to_string(), json!("hello"));
        output.insert("detail".to_string(), json!({"score": 0.9}));
        ctx.set_node_output(NodeId::new("a"), output);
        ctx
    }

    #[test]
    fn variable_reference_resolves() {
        let ctx = context();
        assert_eq!(resolve_reference("${count}", &ctx), Some(json!(3)));
    }

    #[test]
    fn variable_falls_back_to_inputs() {
        let ctx = context();
        assert_eq!(resolve_reference("${m}", &ctx), Some(json!("hi")));
    }

    #[test]
    fn input_root_resolves_initial_inputs() {
        let ctx = context();
        assert_eq!(resolve_reference("${input.m}", &ctx), Some(json!("hi")));
        assert_eq!(
            resolve_reference("${input.nested.inner}", &ctx),
            Some(json!(5))
        );
    }

    #[test]
    fn node_output_path_resolves() {
        let ctx = context();
        assert_eq!(resolve_reference("${a.msg}", &ctx), Some(json!("hello")));
        assert_eq!(
            resolve_reference("${a.detail.score}", &ctx),
            Some(json!(0.9))
        );
    }

    #[test]
    fn missing_intermediate_is_absent_not_error() {
        let ctx = context();
        assert_eq!(resolve_reference("${a.detail.missing}", &ctx), None);
        assert_eq!(resolve_reference("${unknown.path}", &ctx), None);
        assert_eq!(resolve_reference("${}", &ctx), None);
    }

    #[test]
    fn constants_pass_through() {
        let ctx = context();
        assert_eq!(
            resolve_input_value("plain text", &ctx),
            Some(json!("plain text"))
        );
    }

    #[test]
    fn predicate_equality() {
        let ctx = context();
        assert!(evaluate_predicate("${count} == 3", &ctx));
        assert!(!evaluate_predicate("${count} == 4", &ctx));
        assert!(evaluate_predicate("${a.msg} == hello", &ctx));
        assert!(evaluate_predicate("${a.msg} == 'hello'", &ctx));
    }

    #[test]
    fn predicate_ordering() {
        let ctx = context();
        assert!(evaluate_predicate("${count} < 5", &ctx));
        assert!(evaluate_predicate("${count} >= 3", &ctx));
        assert!(!evaluate_predicate("${count} > 3", &ctx));
    }

    #[test]
    fn predicate_truthiness() {
        let ctx = context();
        assert!(evaluate_predicate("${count}", &ctx));
        assert!(!evaluate_predicate("${missing}", &ctx));
        assert!(evaluate_predicate("", &ctx));
    }

    #[test]
    fn predicate_unresolved_comparison_is_false() {
        let ctx = context();
        assert!(!evaluate_predicate("${missing} > 1", &ctx));
    }

    #[test]
    fn vars_predicate_for_guards() {
        let mut vars = JsonMap::new();
        vars.insert("approved".to_string(), json!(true));
        vars.insert("amount".to_string(), json!(120));
        assert!(evaluate_predicate_vars("approved == true", &vars));
        assert!(evaluate_predicate_vars("${amount} > 100", &vars));
        assert!(!evaluate_predicate_vars("amount < 100", &vars));
        assert!(evaluate_predicate_vars("", &vars));
    }
}
