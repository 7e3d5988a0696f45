use crate::regex_ops;
use async_trait::async_trait;
use flowcore::{
    node_types, ExecutionContext, Map, NodeError, NodeHandler, NodeMetadata, NodeResult, NodeSpec, Resolver, Value,
};

/// Writes workflow variables: literals, copies of resolved values, or the
/// result of a named operation on a resolved value
pub struct VariableAssignerNode;

#[async_trait]
impl NodeHandler for VariableAssignerNode {
    fn node_type(&self) -> &str {
        node_types::VARIABLE_ASSIGNER
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let mut assigned = Map::new();
        for assignment in node.config_array("assignments") {
            let Some(name) = assignment
                .get("variableName")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
            else {
                tracing::warn!(node_id = %node.id, "Skipping assignment without variable name");
                continue;
            };

            // Later assignments see earlier ones
            let value = match assign(assignment, &ctx.resolver()) {
                Ok(value) => value,
                Err(e) => return Ok(NodeResult::fail(format!("variable assignment failed: {}", e))),
            };
            tracing::debug!(node_id = %node.id, variable = name, "Assigned variable");
            ctx.set_variable(name, value.clone());
            assigned.insert(name.to_string(), value);
        }
        Ok(NodeResult::success(Value::object([("assignments", Value::Object(assigned))])))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Set, copy or compute workflow variables", "data")
    }
}

fn assign(assignment: &Value, resolver: &Resolver<'_>) -> Result<Value, NodeError> {
    let field = |key: &str| assignment.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
    let mode = field("mode").unwrap_or_else(|| match field("sourceExpression") {
        Some(_) => "assign",
        None => "set",
    });

    match mode {
        "set" => {
            let value = assignment
                .get("value")
                .or_else(|| assignment.get("setValue"))
                .cloned()
                .unwrap_or_default();
            Ok(match (field("valueType").unwrap_or("string"), value) {
                ("string", Value::String(template)) => Value::String(resolver.render(&template)),
                (declared, value) => value.coerce(declared),
            })
        }
        "assign" => Ok(field("sourceExpression")
            .map(|source| resolver.resolve(source))
            .unwrap_or_default()),
        "transform" => {
            let source = field("sourceExpression")
                .ok_or_else(|| NodeError::Configuration("transform mode needs a sourceExpression".to_string()))?;
            let operation = field("operation")
                .ok_or_else(|| NodeError::Configuration("transform mode needs an operation".to_string()))?;
            let value = resolver.resolve(source);
            let source_type = match field("sourceType") {
                Some(declared) if declared != "unknown" => declared,
                _ => value.type_name(),
            };
            let params = assignment.get("operationParams").cloned().unwrap_or_default();
            apply_operation(source_type, operation, value, &Params { raw: &params, resolver })
        }
        other => Err(NodeError::Configuration(format!("unsupported assignment mode: {}", other))),
    }
}

/// `operationParams` accessors
struct Params<'a> {
    raw: &'a Value,
    resolver: &'a Resolver<'a>,
}

impl Params<'_> {
    fn str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    fn int(&self, key: &str) -> Option<i64> {
        self.raw.get(key).and_then(Value::to_number).map(|n| n as i64)
    }

    /// Arithmetic operand, from a literal or a resolved expression
    fn operand(&self) -> f64 {
        if self.raw.get("arithmeticUseVariable").and_then(Value::as_bool) == Some(true) {
            return self
                .str("arithmeticExpression")
                .and_then(|e| self.resolver.resolve(e).to_number())
                .unwrap_or(0.0);
        }
        self.raw.get("arithmeticValue").and_then(Value::to_number).unwrap_or(0.0)
    }

    /// Value to append: placeholders resolve, other text parses as JSON
    /// when it can
    fn append_value(&self) -> Value {
        match self.raw.get("appendValue") {
            Some(Value::String(text)) if text.contains("{{") => self.resolver.resolve(text),
            Some(Value::String(text)) => Value::from_json_str(text).unwrap_or_else(|_| Value::String(text.clone())),
            Some(other) => other.clone(),
            None => Value::Null,
        }
    }
}

fn apply_operation(source_type: &str, operation: &str, value: Value, params: &Params<'_>) -> Result<Value, NodeError> {
    let unsupported = || {
        NodeError::Configuration(format!("unsupported {} operation: {}", source_type, operation))
    };
    match source_type {
        "array" => {
            let mut items = match value {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            let len = items.len();
            Ok(match operation {
                "get_first" => items.into_iter().next().unwrap_or_default(),
                "get_last" => items.pop().unwrap_or_default(),
                "get_index" => {
                    let index = params.int("arrayIndex").unwrap_or(0);
                    usize::try_from(index).ok().and_then(|i| items.get(i).cloned()).unwrap_or_default()
                }
                "length" => Value::from(len),
                "slice" => {
                    let clamp = |n: i64| n.clamp(0, len as i64) as usize;
                    let start = clamp(params.int("sliceStart").unwrap_or(0));
                    let end = clamp(params.int("sliceEnd").unwrap_or(len as i64)).max(start);
                    Value::Array(items[start..end].to_vec())
                }
                "reverse" => {
                    items.reverse();
                    Value::Array(items)
                }
                "unique" => {
                    let mut unique: Vec<Value> = Vec::with_capacity(len);
                    for item in items {
                        if !unique.contains(&item) {
                            unique.push(item);
                        }
                    }
                    Value::Array(unique)
                }
                "join" => {
                    let separator = params.str("joinSeparator").unwrap_or(",");
                    let parts: Vec<String> = items
                        .iter()
                        .map(|item| if item.is_null() { String::new() } else { item.to_string() })
                        .collect();
                    Value::String(parts.join(separator))
                }
                "append" => {
                    match params.append_value() {
                        Value::Array(more) => items.extend(more),
                        Value::Null => {}
                        other => items.push(other),
                    }
                    Value::Array(items)
                }
                "remove_first" => Value::Array(items.into_iter().skip(1).collect()),
                "remove_last" => {
                    items.pop();
                    Value::Array(items)
                }
                _ => return Err(unsupported()),
            })
        }
        "string" => {
            let text = if value.is_null() { String::new() } else { value.to_string() };
            Ok(match operation {
                "length" => Value::from(text.chars().count()),
                "trim" => Value::String(text.trim().to_string()),
                "uppercase" => Value::String(text.to_uppercase()),
                "lowercase" => Value::String(text.to_lowercase()),
                "regex_replace" => {
                    let pattern = params.str("regexPattern").unwrap_or("");
                    let replacement = params.str("regexReplace").unwrap_or("");
                    Value::String(regex_ops::replace(&text, pattern, params.str("regexFlags"), replacement)?)
                }
                "regex_extract" => {
                    let pattern = params.str("regexPattern").unwrap_or("");
                    let group = params.int("regexGroup").unwrap_or(0).max(0) as usize;
                    Value::String(regex_ops::extract(&text, pattern, params.str("regexFlags"), group)?)
                }
                _ => return Err(unsupported()),
            })
        }
        "number" => {
            let n = value.to_number().unwrap_or(0.0);
            let operand = params.operand();
            Ok(Value::Float(match operation {
                "add" => n + operand,
                "subtract" => n - operand,
                "multiply" => n * operand,
                "divide" if operand == 0.0 => {
                    return Err(NodeError::ExecutionFailed("division by zero".to_string()))
                }
                "divide" => n / operand,
                "round" => n.round(),
                "floor" => n.floor(),
                "ceil" => n.ceil(),
                "abs" => n.abs(),
                _ => return Err(unsupported()),
            }))
        }
        "object" => {
            let map = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            Ok(match operation {
                "get_field" => {
                    let root = Value::Object(map);
                    let mut current = Some(&root);
                    for part in params.str("fieldPath").unwrap_or("").split('.').filter(|p| !p.is_empty()) {
                        current = current.and_then(|v| v.as_object()).and_then(|m| m.get(part));
                    }
                    match params.str("fieldPath").filter(|p| !p.is_empty()) {
                        Some(_) => current.cloned().unwrap_or_default(),
                        None => Value::Null,
                    }
                }
                "keys" => Value::Array(map.keys().map(|k| Value::from(k.as_str())).collect()),
                "values" => Value::Array(map.into_values().collect()),
                _ => return Err(unsupported()),
            })
        }
        "boolean" => match operation {
            "not" => Ok(Value::Bool(!value.is_truthy())),
            _ => Err(unsupported()),
        },
        other => Err(NodeError::Configuration(format!("unsupported source type: {}", other))),
    }
}
