//! Optional per-node execution conditions (`config.executionCondition`).
//! A node whose condition is unmet is skipped instead of executed.

use flowcore::{ExecutionContext, NodeSpec, Value};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionCondition {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    logic_operator: Option<String>,
    #[serde(default)]
    conditions: Vec<ConditionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionItem {
    #[serde(default)]
    variable_key: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

/// Whether `node` should run. Missing, disabled or malformed conditions
/// default to running the node.
pub fn should_execute(node: &NodeSpec, ctx: &ExecutionContext) -> bool {
    let Some(raw) = node.config("executionCondition") else {
        return true;
    };
    let condition: ExecutionCondition = match serde_json::from_value(raw.to_json()) {
        Ok(condition) => condition,
        Err(e) => {
            tracing::warn!(node_id = %node.id, error = %e, "Ignoring malformed execution condition");
            return true;
        }
    };
    if !condition.enabled || condition.conditions.is_empty() {
        return true;
    }

    let results = condition.conditions.iter().map(|item| evaluate_item(item, ctx));
    let result = match condition.logic_operator.as_deref() {
        Some("or") => results.into_iter().any(|r| r),
        _ => results.into_iter().all(|r| r),
    };
    tracing::debug!(node_id = %node.id, result, "Evaluated execution condition");
    result
}

fn evaluate_item(item: &ConditionItem, ctx: &ExecutionContext) -> bool {
    let Some(key) = item.variable_key.as_deref().filter(|k| !k.is_empty()) else {
        return true;
    };
    let actual = ctx.resolver().lookup(key);
    let expected = item.value.as_ref().map(|v| v.to_string()).unwrap_or_default();
    match item.operator.as_deref() {
        Some(op) => apply_operator(op, &actual, &expected),
        None => false,
    }
}

fn apply_operator(op: &str, actual: &Value, expected: &str) -> bool {
    let text = if actual.is_null() { String::new() } else { actual.to_string() };
    let number = |v: &Value| v.to_number().unwrap_or(0.0);
    let expected_number = expected.trim().parse::<f64>().unwrap_or(0.0);

    match op {
        "contains" => text.contains(expected),
        "not_contains" => !text.contains(expected),
        "starts_with" => text.starts_with(expected),
        "ends_with" => text.ends_with(expected),
        "is" => text == expected,
        "is_not" => text != expected,
        "is_empty" => actual.is_empty(),
        "is_not_empty" => !actual.is_empty(),
        "equals" => number(actual) == expected_number,
        "not_equals" => number(actual) != expected_number,
        "greater_than" => number(actual) > expected_number,
        "less_than" => number(actual) < expected_number,
        "greater_than_or_equal" => number(actual) >= expected_number,
        "less_than_or_equal" => number(actual) <= expected_number,
        "is_true" => truthy(actual),
        "is_false" => !truthy(actual),
        "exists" => !actual.is_null(),
        "not_exists" => actual.is_null(),
        other => {
            tracing::warn!(operator = other, "Unknown execution condition operator");
            false
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        other => other.is_truthy(),
    }
}
