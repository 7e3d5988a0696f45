use async_trait::async_trait;
use flowcore::{node_types, ExecutionContext, NodeError, NodeHandler, NodeMetadata, NodeResult, NodeSpec, Value};
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl NodeHandler for DelayNode {
    fn node_type(&self) -> &str {
        node_types::DELAY
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let delay_ms = match node.config("delayMs") {
            Some(raw) => {
                let resolved = ctx.resolver().resolve_value(raw);
                resolved
                    .to_number()
                    .filter(|ms| *ms >= 0.0)
                    .ok_or_else(|| NodeError::InvalidInputType {
                        field: "delayMs".to_string(),
                        expected: "non-negative number".to_string(),
                        actual: resolved.type_name().to_string(),
                    })? as u64
            }
            None => 1000,
        };
        let value = node
            .config("value")
            .map(|raw| ctx.resolver().resolve_value(raw))
            .unwrap_or_default();

        ctx.info(format!("Delaying for {}ms", delay_ms));
        sleep(Duration::from_millis(delay_ms)).await;

        Ok(NodeResult::success(Value::object([
            ("delayMs", Value::from(delay_ms as i64)),
            ("value", value),
        ])))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Delay execution for specified milliseconds", "time")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{Graph, Map};
    use std::sync::Arc;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        let inputs = Map::from([("wait".to_string(), Value::from(20))]);
        ExecutionContext::new(Uuid::new_v4(), "f", Arc::new(Graph::new()), inputs)
    }

    #[tokio::test]
    async fn sleeps_then_passes_value_through() {
        let node = NodeSpec::new("d", node_types::DELAY)
            .with_config("delayMs", "{{input.wait}}")
            .with_config("value", "waited {{input.wait}}");
        let started = std::time::Instant::now();
        let result = DelayNode.execute(&node, &mut ctx()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        let NodeResult::Success { output } = result else {
            panic!("expected success, got {:?}", result);
        };
        assert_eq!(output.get("delayMs"), Some(&Value::from(20)));
        assert_eq!(output.get("value"), Some(&Value::from("waited 20")));
    }

    #[tokio::test]
    async fn negative_delay_is_rejected() {
        let node = NodeSpec::new("d", node_types::DELAY).with_config("delayMs", -5);
        assert!(DelayNode.execute(&node, &mut ctx()).await.is_err());
    }
}
