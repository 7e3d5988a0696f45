use async_trait::async_trait;
use flowcore::expression::evaluate_bool;
use flowcore::{node_types, ExecutionContext, NodeError, NodeHandler, NodeMetadata, NodeResult, NodeSpec, Value};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BranchConfig {
    #[serde(default)]
    branches: Vec<Branch>,
    #[serde(default)]
    else_handle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Branch {
    #[serde(default)]
    branch_id: Option<String>,
    #[serde(default)]
    handle_id: Option<String>,
    #[serde(default)]
    expression: Option<String>,
}

/// Chooses an outgoing branch. The engine follows the edge whose source
/// handle equals the output's `matchedHandleId`.
pub struct ConditionNode;

impl ConditionNode {
    /// First branch whose expression holds, else the `else` handle.
    /// Branches that fail to evaluate are skipped.
    fn match_branches(config: &BranchConfig, ctx: &ExecutionContext) -> String {
        let resolver = ctx.resolver();
        for branch in &config.branches {
            let branch_id = branch.branch_id.as_deref().unwrap_or("?");
            let Some(expression) = branch.expression.as_deref().filter(|e| !e.trim().is_empty()) else {
                tracing::warn!(branch_id, "Skipping branch without expression");
                continue;
            };
            match evaluate_bool(expression, &resolver) {
                Ok(true) => {
                    if let Some(handle) = &branch.handle_id {
                        tracing::debug!(branch_id, handle = %handle, "Branch matched");
                        return handle.clone();
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(branch_id, expression, error = %e, "Branch expression failed"),
            }
        }
        config.else_handle_id.clone().unwrap_or_else(|| "false".to_string())
    }
}

#[async_trait]
impl NodeHandler for ConditionNode {
    fn node_type(&self) -> &str {
        node_types::CONDITION
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let expression = node.require_config_str("expression")?;

        let branch_config = expression
            .starts_with('{')
            .then(|| serde_json::from_str::<BranchConfig>(expression).ok())
            .flatten();

        let matched = match branch_config {
            Some(config) => Self::match_branches(&config, ctx),
            None => match evaluate_bool(expression, &ctx.resolver()) {
                Ok(result) => result.to_string(),
                Err(e) => return Ok(NodeResult::fail(format!("condition evaluation failed: {}", e))),
            },
        };

        tracing::info!(node_id = %node.id, matched = %matched, "Condition evaluated");
        Ok(NodeResult::success(Value::object([
            ("result", Value::from(matched == "true")),
            ("matchedHandleId", Value::from(matched)),
            ("expression", Value::from(expression)),
        ])))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Route to the first branch whose expression holds", "logic")
    }
}
