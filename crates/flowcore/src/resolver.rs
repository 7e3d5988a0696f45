//! Namespace resolution for `{{path}}` templates and dotted paths.
//!
//! Roots: `input`/`inputs`, `nodes`, `var`/`variable`/`variables`,
//! `const`/`constant`/`constants` and `context`. A bare root falls back to a
//! variable, then a node id, then an input of that name. Missing paths resolve
//! to [`Value::Null`].

use crate::context::ExecutionContext;
use crate::value::{Map, Value};
use once_cell::sync::Lazy;
use regex::Regex;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][\w.\-\[\]]*?)\s*\}\}").expect("valid placeholder pattern")
});

static ANY_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[^{}]*\}\}").expect("valid placeholder pattern"));

/// True when `text` still holds a `{{...}}` placeholder
pub fn contains_unresolved_variables(text: &str) -> bool {
    ANY_PLACEHOLDER.is_match(text)
}

/// Resolves paths and templates against an execution context, optionally
/// layered with per-call locals (e.g. a fan-out item) that shadow every root.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    ctx: &'a ExecutionContext,
    locals: Option<&'a Map>,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx, locals: None }
    }

    pub fn with_locals(mut self, locals: &'a Map) -> Self {
        self.locals = Some(locals);
        self
    }

    /// Resolve an expression: a lone placeholder keeps the value's type,
    /// mixed text renders to a string, anything else is a bare path.
    pub fn resolve(&self, expression: &str) -> Value {
        let trimmed = expression.trim();
        if let Some(path) = single_placeholder(trimmed) {
            return self.lookup(path);
        }
        if trimmed.contains("{{") {
            return Value::String(self.render(expression));
        }
        self.lookup(trimmed)
    }

    /// Substitute every placeholder. Placeholders that resolve to null stay
    /// in the output verbatim.
    pub fn render(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let value = self.lookup(&caps[1]);
                if value.is_null() {
                    tracing::debug!(placeholder = &caps[0], "unresolved template variable");
                    caps[0].to_string()
                } else {
                    value.to_string()
                }
            })
            .into_owned()
    }

    /// Resolve placeholders inside every string of a value tree. Strings
    /// without placeholders are kept as literals.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if s.contains("{{") => self.resolve(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Look up a dotted path (placeholder braces optional). Literals such as
    /// `true`, `42` or `'text'` resolve to themselves.
    pub fn lookup(&self, path: &str) -> Value {
        let path = strip_braces(path.trim());
        if let Some(literal) = parse_literal(path) {
            return literal;
        }
        let segments = split_path(path);
        let Some((root, rest)) = segments.split_first() else {
            return Value::Null;
        };

        if let Some(value) = self.locals.and_then(|locals| locals.get(root.as_str())) {
            return descend(value, rest);
        }

        match root.as_str() {
            "input" | "inputs" => descend_map(self.ctx.inputs(), rest),
            "nodes" => self.lookup_node(rest),
            "var" | "variable" | "variables" => descend_map(self.ctx.variables(), rest),
            "const" | "constant" | "constants" => descend_map(self.ctx.constants(), rest),
            "context" => descend(&self.context_namespace(), rest),
            name => {
                if let Some(value) = self.ctx.variable(name) {
                    descend(value, rest)
                } else if let Some(output) = self.ctx.node_output(name) {
                    descend(output, rest)
                } else if let Some(input) = self.ctx.inputs().get(name) {
                    descend(input, rest)
                } else {
                    Value::Null
                }
            }
        }
    }

    fn lookup_node(&self, rest: &[String]) -> Value {
        let Some((node_id, fields)) = rest.split_first() else {
            return Value::Object(self.ctx.node_outputs().clone());
        };
        let Some(output) = self.ctx.node_output(node_id) else {
            return Value::Null;
        };
        // `nodes.<id>.output.x` is accepted as an alias for `nodes.<id>.x`
        match fields.split_first() {
            Some((first, tail)) if first == "output" && output.get("output").is_none() => descend(output, tail),
            _ => descend(output, fields),
        }
    }

    fn context_namespace(&self) -> Value {
        Value::object([
            ("executionId", Value::from(self.ctx.execution_id().to_string())),
            ("flowId", Value::from(self.ctx.flow_id())),
            ("currentNodeId", Value::from(self.ctx.current_node_id())),
            ("timestamp", Value::from(chrono::Utc::now().timestamp_millis())),
        ])
    }
}

fn single_placeholder(text: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(text)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == text.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn strip_braces(path: &str) -> &str {
    path.strip_prefix("{{")
        .and_then(|p| p.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(path)
}

fn parse_literal(text: &str) -> Option<Value> {
    match text {
        "" | "null" => return Some(Value::Null),
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    let quoted = (text.starts_with('"') && text.ends_with('"'))
        || (text.starts_with('\'') && text.ends_with('\''));
    if quoted && text.len() >= 2 {
        return Some(Value::String(text[1..text.len() - 1].to_string()));
    }
    if text.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return Value::parse_number(text);
    }
    None
}

/// `a.b[0].c` -> `["a", "b", "0", "c"]`
pub fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .flat_map(|segment| segment.split(|c: char| c == '[' || c == ']'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn descend_map(map: &Map, rest: &[String]) -> Value {
    match rest.split_first() {
        None => Value::Object(map.clone()),
        Some((key, tail)) => map.get(key.as_str()).map(|v| descend(v, tail)).unwrap_or_default(),
    }
}

fn descend(value: &Value, segments: &[String]) -> Value {
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        match current.get(segment) {
            Some(next) => current = next,
            None if segment == "length" && i == segments.len() - 1 => {
                return match current {
                    Value::Array(items) => Value::from(items.len()),
                    Value::String(s) => Value::from(s.chars().count()),
                    _ => Value::Null,
                };
            }
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Graph;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        let inputs = match Value::from(json!({"x": 5, "user": {"name": "ada", "tags": ["a", "b"]}})) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), "flow-a", Arc::new(Graph::new()), inputs)
            .with_constants(Map::from([("region".to_string(), Value::from("eu"))]));
        ctx.set_node_output("fetch", Value::from(json!({"body": {"items": [{"id": 7}]}})));
        ctx.set_variable("count", Value::from(2));
        ctx
    }

    #[test]
    fn resolves_each_namespace() {
        let ctx = context();
        let r = ctx.resolver();
        assert_eq!(r.resolve("input.x"), Value::from(5));
        assert_eq!(r.resolve("inputs.user.tags[1]"), Value::from("b"));
        assert_eq!(r.resolve("nodes.fetch.body.items[0].id"), Value::from(7));
        assert_eq!(r.resolve("nodes.fetch.output.body.items.0.id"), Value::from(7));
        assert_eq!(r.resolve("var.count"), Value::from(2));
        assert_eq!(r.resolve("constants.region"), Value::from("eu"));
        assert_eq!(r.resolve("context.flowId"), Value::from("flow-a"));
    }

    #[test]
    fn bare_roots_fall_back_to_variables_nodes_then_inputs() {
        let ctx = context();
        let r = ctx.resolver();
        assert_eq!(r.resolve("count"), Value::from(2));
        assert_eq!(r.resolve("fetch.body.items.length"), Value::from(1));
        assert_eq!(r.resolve("user.name"), Value::from("ada"));
    }

    #[test]
    fn missing_paths_are_null() {
        let ctx = context();
        assert!(ctx.resolver().resolve("nodes.nope.value").is_null());
        assert!(ctx.resolver().resolve("input.user.missing.deeper").is_null());
    }

    #[test]
    fn lone_placeholder_keeps_type_and_mixed_text_renders() {
        let ctx = context();
        let r = ctx.resolver();
        assert_eq!(r.resolve("{{ input.x }}"), Value::from(5));
        assert_eq!(r.resolve("x={{input.x}}, user={{input.user.name}}"), Value::from("x=5, user=ada"));
    }

    #[test]
    fn unresolved_placeholders_survive_rendering() {
        let ctx = context();
        let rendered = ctx.resolver().render("id={{input.missing}}");
        assert_eq!(rendered, "id={{input.missing}}");
        assert!(contains_unresolved_variables(&rendered));
        assert!(!contains_unresolved_variables("id=5"));
    }

    #[test]
    fn locals_shadow_context_roots() {
        let ctx = context();
        let locals = Map::from([("item".to_string(), Value::from(json!({"sku": "k1"})))]);
        let r = ctx.resolver().with_locals(&locals);
        assert_eq!(r.resolve("item.sku"), Value::from("k1"));
        assert_eq!(r.resolve("input.x"), Value::from(5));
    }

    #[test]
    fn resolve_value_walks_trees() {
        let ctx = context();
        let template = Value::from(json!({"n": "{{input.x}}", "list": ["{{constants.region}}", "plain"]}));
        assert_eq!(
            ctx.resolver().resolve_value(&template),
            Value::from(json!({"n": 5, "list": ["eu", "plain"]}))
        );
    }
}
