use crate::regex_ops;
use async_trait::async_trait;
use flowcore::expression::evaluate;
use flowcore::{node_types, ExecutionContext, Map, NodeError, NodeHandler, NodeMetadata, NodeResult, NodeSpec, Value};

/// Reshape data with field mappings or a single expression
pub struct TransformNode;

#[async_trait]
impl NodeHandler for TransformNode {
    fn node_type(&self) -> &str {
        node_types::TRANSFORM
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let result = match node.config_str("mode").unwrap_or("mapping") {
            "advanced" => advanced(node, ctx),
            _ => Ok(mapping(node, ctx)),
        };
        match result {
            Ok(output) => {
                tracing::info!(node_id = %node.id, fields = output.len(), "Transform completed");
                Ok(NodeResult::success(output))
            }
            Err(e) => Ok(NodeResult::fail(format!("transform failed: {}", e))),
        }
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Map fields or evaluate an expression into a new object", "transform")
    }
}

/// Each mapping writes `target` from an `expression` or a `source` path,
/// optionally post-processed by a regex. A mapping that fails yields null.
fn mapping(node: &NodeSpec, ctx: &ExecutionContext) -> Map {
    let resolver = ctx.resolver();
    let mut output = Map::new();
    for mapping in node.config_array("mappings") {
        let field = |key: &str| mapping.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty());
        let Some(target) = field("target") else {
            continue;
        };

        let value = match (field("expression"), field("source")) {
            (Some(expression), _) => evaluate(expression, &resolver),
            (None, Some(source)) => Ok(resolver.lookup(source)),
            (None, None) => Ok(Value::Null),
        };
        let value = value.and_then(|v| apply_regex(v, mapping));

        match value {
            Ok(value) => {
                output.insert(target.to_string(), value);
            }
            Err(e) => {
                tracing::warn!(node_id = %node.id, target, error = %e, "Mapping failed");
                output.insert(target.to_string(), Value::Null);
            }
        }
    }
    output
}

/// `advancedScript` evaluated as one expression; non-object results are
/// wrapped as `{result}`
fn advanced(node: &NodeSpec, ctx: &ExecutionContext) -> Result<Map, NodeError> {
    let Some(script) = node.config_str("advancedScript") else {
        return Ok(Map::new());
    };
    match evaluate(script, &ctx.resolver())? {
        Value::Object(map) => Ok(map),
        other => Ok(Map::from([("result".to_string(), other)])),
    }
}

fn apply_regex(value: Value, mapping: &Value) -> Result<Value, NodeError> {
    let field = |key: &str| mapping.get(key).and_then(Value::as_str);
    let mode = field("regexMode").unwrap_or("none");
    if mode == "none" || mode.is_empty() {
        return Ok(value);
    }
    let text = if value.is_null() { String::new() } else { value.to_string() };
    let Some(pattern) = field("regexPattern").filter(|p| !p.is_empty()) else {
        return Ok(Value::String(text));
    };
    let flags = field("regexFlags");

    Ok(match mode {
        "replace" => Value::String(regex_ops::replace(&text, pattern, flags, field("regexReplace").unwrap_or(""))?),
        "extract" => {
            let group = mapping
                .get("regexGroup")
                .and_then(Value::to_number)
                .map(|g| g.max(0.0) as usize)
                .unwrap_or(0);
            Value::String(regex_ops::extract(&text, pattern, flags, group)?)
        }
        "match" => Value::Bool(regex_ops::is_match(&text, pattern, flags)?),
        _ => value,
    })
}

/// Parse JSON text and optionally pick declared fields
pub struct JsonParserNode;

#[async_trait]
impl NodeHandler for JsonParserNode {
    fn node_type(&self) -> &str {
        node_types::JSON_PARSER
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let source_expression = node.require_config_str("sourceExpression")?;
        let source = ctx.resolver().resolve(source_expression);

        let parsed = match source {
            Value::Null => {
                return Ok(NodeResult::fail(format!(
                    "source data is null for expression: {}",
                    source_expression
                )))
            }
            Value::String(text) => match Value::from_json_str(&text) {
                Ok(parsed) => parsed,
                Err(e) => return Ok(NodeResult::fail(format!("JSON parsing failed: {}", e))),
            },
            other => other,
        };

        let fields = node.config_array("outputFields");
        let output = if fields.is_empty() {
            match parsed {
                Value::Object(map) => map,
                other => Map::from([("result".to_string(), other)]),
            }
        } else {
            extract_fields(&parsed, fields)
        };
        tracing::info!(node_id = %node.id, fields = output.len(), "JSON parsed");
        Ok(NodeResult::success(output))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Parse JSON text into structured output", "transform")
    }
}

/// Pick `[{path, type?, children?}]` out of a parsed document. Missing
/// paths yield null; `children` are merged into object values.
fn extract_fields(root: &Value, fields: &[Value]) -> Map {
    let mut output = Map::new();
    for field in fields {
        let Some(path) = field.get("path").and_then(Value::as_str) else {
            continue;
        };
        let Some(found) = value_at(root, path) else {
            output.insert(path.to_string(), Value::Null);
            continue;
        };
        let mut value = match field.get("type").and_then(Value::as_str) {
            Some("array") if !matches!(found, Value::Array(_)) => Value::Array(vec![found.clone()]),
            Some("string") if !matches!(found, Value::String(_)) => Value::String(found.to_json_string()),
            Some(declared) => found.clone().coerce(declared),
            None => found.clone(),
        };
        let children = field.get("children").and_then(Value::as_array);
        if let (Some(children), Some(map)) = (children, value.as_object_mut()) {
            map.extend(extract_fields(found, children));
        }
        output.insert(path.to_string(), value);
    }
    output
}

/// Dotted path with `[n]` index segments; empty or `[*]` is the root
fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() || path == "[*]" {
        return Some(root);
    }
    let mut current = root;
    for part in path.split('.') {
        if part == "[*]" {
            return Some(current);
        }
        let key = part
            .strip_prefix('[')
            .and_then(|p| p.strip_suffix(']'))
            .unwrap_or(part);
        current = current.get(key)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::Graph;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        let inputs = Map::from([
            ("x".to_string(), Value::from(5)),
            ("email".to_string(), Value::from("Ada@Example.com")),
            ("raw".to_string(), Value::from(r#"{"user": {"name": "ada", "tags": ["a", "b"]}, "count": "3"}"#)),
        ]);
        ExecutionContext::new(Uuid::new_v4(), "f", Arc::new(Graph::new()), inputs)
    }

    fn success(result: NodeResult) -> Value {
        match result {
            NodeResult::Success { output } => output,
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn mapping_mode_evaluates_expressions_and_sources() {
        let node = NodeSpec::new("t", node_types::TRANSFORM).with_config(
            "mappings",
            Value::from(json!([
                {"target": "y", "expression": "{{input.x}} * 2"},
                {"target": "copy", "source": "input.x"},
                {"target": "bad", "expression": "1 / 0"},
                {"target": "domain", "source": "input.email", "regexMode": "extract", "regexPattern": "@(.+)$", "regexGroup": 1},
                {"source": "input.x"}
            ])),
        );
        let output = success(TransformNode.execute(&node, &mut ctx()).await.unwrap());
        assert_eq!(output.get("y"), Some(&Value::from(10)));
        assert_eq!(output.get("copy"), Some(&Value::from(5)));
        assert_eq!(output.get("bad"), Some(&Value::Null));
        assert_eq!(output.get("domain"), Some(&Value::from("Example.com")));
        assert_eq!(output.as_object().map(|m| m.len()), Some(4));
    }

    #[tokio::test]
    async fn advanced_mode_wraps_scalars() {
        let node = NodeSpec::new("t", node_types::TRANSFORM)
            .with_config("mode", "advanced")
            .with_config("advancedScript", "{{input.x}} + 1");
        let output = success(TransformNode.execute(&node, &mut ctx()).await.unwrap());
        assert_eq!(output.get("result"), Some(&Value::from(6)));
    }

    #[tokio::test]
    async fn json_parser_extracts_typed_fields() {
        let node = NodeSpec::new("j", node_types::JSON_PARSER)
            .with_config("sourceExpression", "{{input.raw}}")
            .with_config(
                "outputFields",
                Value::from(json!([
                    {"path": "count", "type": "number"},
                    {"path": "user.tags.[1]"},
                    {"path": "missing"}
                ])),
            );
        let output = success(JsonParserNode.execute(&node, &mut ctx()).await.unwrap());
        assert_eq!(output.get("count"), Some(&Value::from(3)));
        assert_eq!(output.get("user.tags.[1]"), Some(&Value::from("b")));
        assert_eq!(output.get("missing"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn json_parser_rejects_invalid_text() {
        let node = NodeSpec::new("j", node_types::JSON_PARSER).with_config("sourceExpression", "{{input.email}}");
        assert!(matches!(
            JsonParserNode.execute(&node, &mut ctx()).await.unwrap(),
            NodeResult::Fail { .. }
        ));
    }
}
