mod common;

use common::*;
use flowcore::{node_types, ExecutionStatus, NodeSpec, Value};
use flowruntime::FlowRuntime;
use serde_json::json;

fn subflow(id: &str, target: &str) -> NodeSpec {
    NodeSpec::new(id, node_types::SUBFLOW).with_config("subflowId", target)
}

fn for_each(target: &str, items: &str) -> NodeSpec {
    NodeSpec::new("each", node_types::FOR_EACH)
        .with_config("subflowId", target)
        .with_config("itemsExpression", items)
}

fn summary_end() -> NodeSpec {
    end_node(json!([
        {"name": "total", "expression": "{{nodes.each.total}}"},
        {"name": "successCount", "expression": "{{nodes.each.successCount}}"},
        {"name": "failedCount", "expression": "{{nodes.each.failedCount}}"},
        {"name": "results", "expression": "{{nodes.each.results}}"}
    ]))
}

async fn child_runs(rt: &FlowRuntime, flow_id: &str) -> usize {
    rt.list_executions()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.flow_id == flow_id)
        .count()
}

#[tokio::test]
async fn mutual_recursion_is_detected() {
    let rt = runtime();
    rt.register_flow(linear("A", vec![subflow("call-b", "B")], end_node(json!([]))))
        .await
        .unwrap();
    rt.register_flow(linear("B", vec![subflow("call-a", "A")], end_node(json!([]))))
        .await
        .unwrap();

    let record = rt.execute("A", None, Default::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(
        message.contains("circular sub-workflow call detected: A -> B -> A"),
        "unexpected error: {}",
        message
    );
    // A and B started; the second A never did
    assert_eq!(child_runs(&rt, "A").await, 1);
    assert_eq!(child_runs(&rt, "B").await, 1);
}

#[tokio::test]
async fn self_recursion_is_detected() {
    let rt = runtime();
    rt.register_flow(linear("A", vec![subflow("again", "A")], end_node(json!([]))))
        .await
        .unwrap();

    let record = rt.execute("A", None, Default::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("circular sub-workflow call detected: A -> A")
    );
}

#[tokio::test]
async fn subflow_outputs_flow_back_to_parent() {
    let rt = runtime();
    rt.register_flow(linear(
        "child",
        vec![NodeSpec::new("double", "double")],
        end_node(json!([{"name": "y", "expression": "{{nodes.double.y}}"}])),
    ))
    .await
    .unwrap();
    let call = subflow("sub", "child")
        .with_config(
            "inputMappings",
            Value::from(json!([{"targetVariable": "x", "sourceExpression": "{{input.n}}"}])),
        )
        .with_config("outputVariableName", "childOut");
    rt.register_flow(linear(
        "parent",
        vec![call],
        end_node(json!([
            {"name": "y", "expression": "{{var.childOut.y}}"},
            {"name": "status", "expression": "{{nodes.sub._status}}"}
        ])),
    ))
    .await
    .unwrap();

    let record = rt.execute("parent", None, json_map(json!({"n": 21}))).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(
        record.output_data,
        Some(Value::from(json!({"y": 42, "status": "COMPLETED"})))
    );

    let child = rt
        .list_executions()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.flow_id == "child")
        .unwrap();
    assert_eq!(child.parent_execution_id, Some(record.id));
    assert_eq!(child.parent_node_id.as_deref(), Some("sub"));
}

#[tokio::test]
async fn failed_child_fails_the_subflow_node() {
    let rt = runtime();
    rt.register_flow(linear("child", vec![NodeSpec::new("m", "maybeFail")], end_node(json!([]))))
        .await
        .unwrap();
    let call = subflow("sub", "child").with_config(
        "inputMappings",
        Value::from(json!([{"targetVariable": "fail", "sourceExpression": "true"}])),
    );
    rt.register_flow(linear("parent", vec![call], end_node(json!([]))))
        .await
        .unwrap();

    let record = rt.execute("parent", None, Default::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("sub-workflow execution failed: asked to fail")
    );
}

#[tokio::test]
async fn waiting_child_pauses_parent() {
    let rt = runtime();
    rt.register_flow(linear(
        "child",
        vec![NodeSpec::new("wait", "wait").with_config("key", "child-cb")],
        end_node(json!([])),
    ))
    .await
    .unwrap();
    rt.register_flow(linear("parent", vec![subflow("sub", "child")], end_node(json!([]))))
        .await
        .unwrap();

    let record = rt.execute("parent", None, Default::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Paused);
    assert_eq!(record.current_node_id.as_deref(), Some("sub"));

    let callback = rt.get_callback("child-cb").await.unwrap().unwrap();
    assert_ne!(callback.execution_id, record.id);
}

#[tokio::test]
async fn parallel_results_keep_input_order() {
    let rt = runtime();
    rt.register_flow(linear(
        "item",
        vec![NodeSpec::new("sleep", "sleep")
            .with_config("ms", "{{input.item.delay}}")
            .with_config("value", "{{input.item.name}}")],
        end_node(json!([{"name": "name", "expression": "{{nodes.sleep.value}}"}])),
    ))
    .await
    .unwrap();
    rt.register_flow(linear(
        "parent",
        vec![for_each("item", "{{input.items}}").with_config("mode", "parallel")],
        summary_end(),
    ))
    .await
    .unwrap();

    let items = json!([
        {"name": "a", "delay": 60},
        {"name": "b", "delay": 30},
        {"name": "c", "delay": 5}
    ]);
    let record = rt.execute("parent", None, json_map(json!({"items": items}))).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);

    let output = record.output_data.unwrap();
    assert_eq!(output.get("total"), Some(&Value::from(3)));
    assert_eq!(output.get("successCount"), Some(&Value::from(3)));
    let names: Vec<_> = output
        .get("results")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .map(|r| r.get("output").and_then(|o| o.get("name")).cloned().unwrap_or_default())
        .collect();
    assert_eq!(names, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
}

#[tokio::test]
async fn serial_stops_at_first_failure() {
    let rt = runtime();
    rt.register_flow(linear("item", vec![NodeSpec::new("m", "maybeFail")], end_node(json!([]))))
        .await
        .unwrap();
    let each = for_each("item", "{{input.items}}").with_config(
        "inputMappings",
        Value::from(json!([{"targetVariable": "fail", "sourceExpression": "{{item.fail}}"}])),
    );
    rt.register_flow(linear("parent", vec![each], summary_end()))
        .await
        .unwrap();

    let items = json!([{"fail": false}, {"fail": true}, {"fail": false}]);
    let record = rt.execute("parent", None, json_map(json!({"items": items}))).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("item 2 failed: asked to fail"));
    assert_eq!(child_runs(&rt, "item").await, 2);
}

#[tokio::test]
async fn continue_on_error_counts_failures() {
    let rt = runtime();
    rt.register_flow(linear("item", vec![NodeSpec::new("m", "maybeFail")], end_node(json!([]))))
        .await
        .unwrap();
    let each = for_each("item", "{{input.items}}")
        .with_config("mode", "parallel")
        .with_config("continueOnError", true)
        .with_config(
            "inputMappings",
            Value::from(json!([{"targetVariable": "fail", "sourceExpression": "{{item.fail}}"}])),
        );
    rt.register_flow(linear("parent", vec![each], summary_end()))
        .await
        .unwrap();

    let items = json!([{"fail": true}, {"fail": false}, {"fail": true}]);
    let record = rt.execute("parent", None, json_map(json!({"items": items}))).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);

    let output = record.output_data.unwrap();
    assert_eq!(output.get("successCount"), Some(&Value::from(1)));
    assert_eq!(output.get("failedCount"), Some(&Value::from(2)));
    let first = &output.get("results").and_then(Value::as_array).unwrap()[0];
    assert_eq!(first.get("success"), Some(&Value::from(false)));
    assert_eq!(first.get("error"), Some(&Value::from("asked to fail")));
}

#[tokio::test]
async fn parallel_failure_without_continue_fails_node() {
    let rt = runtime();
    rt.register_flow(linear("item", vec![NodeSpec::new("m", "maybeFail")], end_node(json!([]))))
        .await
        .unwrap();
    let each = for_each("item", "{{input.items}}")
        .with_config("mode", "parallel")
        .with_config(
            "inputMappings",
            Value::from(json!([{"targetVariable": "fail", "sourceExpression": "{{item.fail}}"}])),
        );
    rt.register_flow(linear("parent", vec![each], summary_end()))
        .await
        .unwrap();

    let items = json!([{"fail": false}, {"fail": true}]);
    let record = rt.execute("parent", None, json_map(json!({"items": items}))).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("parallel execution has failed items: asked to fail")
    );
    // Every item still ran
    assert_eq!(child_runs(&rt, "item").await, 2);
}

#[tokio::test]
async fn empty_items_complete_without_children() {
    let rt = runtime();
    rt.register_flow(linear("item", vec![], end_node(json!([])))).await.unwrap();
    rt.register_flow(linear("parent", vec![for_each("item", "{{input.items}}")], summary_end()))
        .await
        .unwrap();

    let record = rt.execute("parent", None, json_map(json!({"items": []}))).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.output_data.unwrap().get("total"), Some(&Value::from(0)));
    assert_eq!(child_runs(&rt, "item").await, 0);
}

#[tokio::test]
async fn non_array_items_fail_the_node() {
    let rt = runtime();
    rt.register_flow(linear("item", vec![], end_node(json!([])))).await.unwrap();
    rt.register_flow(linear("parent", vec![for_each("item", "{{input.items}}")], summary_end()))
        .await
        .unwrap();

    let record = rt
        .execute("parent", None, json_map(json!({"items": {"not": "a list"}})))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("items must be an array"));
}
