// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{node_types, ExecutionEvent, ExecutionStatus, FlowDefinition, Graph, Map, NodeEvent, NodeSpec, Value};
use flowruntime::{validate_graph, CallbackOutcome, FlowRuntime, RuntimeConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Extra definitions to publish, for sub-workflow and foreach nodes
        #[arg(long = "with")]
        with: Vec<PathBuf>,

        /// Payload to deliver if the run pauses on a callback
        #[arg(long)]
        reply: Option<String>,
    },

    /// Validate a workflow definition file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            file,
            input,
            with,
            reply,
        } => {
            run_workflow(file, input, with, reply).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn load_definition(file: &Path) -> Result<FlowDefinition> {
    tracing::debug!(path = %file.display(), "Loading flow definition");
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))
}

fn parse_payload(text: Option<String>) -> Result<Value> {
    match text {
        Some(text) => Ok(Value::from_json_str(&text)?),
        None => Ok(Value::Null),
    }
}

fn runtime() -> FlowRuntime {
    FlowRuntime::with_config(flownodes::standard_registry(), RuntimeConfig::default())
}

async fn run_workflow(file: PathBuf, input: Option<String>, with: Vec<PathBuf>, reply: Option<String>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let definition = load_definition(&file)?;
    println!("📋 Workflow: {} (v{})", definition.name, definition.version);
    println!("   Nodes: {}", definition.graph.nodes.len());
    println!("   Edges: {}", definition.graph.edges.len());
    println!();

    let inputs: Map = match parse_payload(input)? {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        _ => bail!("Input must be a JSON object"),
    };

    let runtime = runtime();
    for extra in &with {
        runtime.register_flow(load_definition(extra)?).await?;
    }
    let flow_id = definition.id.clone();
    runtime.register_flow(definition).await?;

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let mut record = runtime.execute(&flow_id, None, inputs).await?;

    if record.status == ExecutionStatus::Paused {
        let pending = runtime
            .node_executions(record.id)
            .await?
            .into_iter()
            .rev()
            .find_map(|n| n.execution_data.and_then(|d| d.get("callbackKey").cloned()));
        match (pending, reply) {
            (Some(Value::String(key)), Some(reply)) => {
                println!("📨 Delivering reply to callback {}", key);
                match runtime.handle_callback(&key, parse_payload(Some(reply))?).await? {
                    CallbackOutcome::Resumed(resumed) => record = resumed,
                    other => println!("   Callback not applied: {:?}", other),
                }
            }
            (Some(Value::String(key)), None) => {
                println!("⏸️  Waiting on callback {}; pass --reply to deliver one", key);
            }
            _ => {}
        }
    }

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", record.id);
    println!("   Status: {:?}", record.status);
    let nodes = runtime.node_executions(record.id).await?;
    println!("   Nodes run: {}", nodes.len());
    if let Some(error) = &record.error_message {
        println!("   Error: {}", error);
    }

    if let Some(outputs) = record.output_data.as_ref().and_then(Value::as_object) {
        if !outputs.is_empty() {
            println!();
            println!("📤 Outputs:");
            for (key, value) in outputs {
                println!("   {}: {}", key, serde_json::to_string(&value.to_json())?);
            }
        }
    }

    if record.status == ExecutionStatus::Failed {
        bail!("workflow failed");
    }
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { flow_id, parent_execution_id, .. } => match parent_execution_id {
            Some(parent) => println!("▶️  Sub-workflow {} started (parent {})", flow_id, parent),
            None => println!("▶️  Workflow {} started", flow_id),
        },
        ExecutionEvent::WorkflowResumed { node_id, .. } => {
            println!("🔁 Workflow resumed at {}", node_id);
        }
        ExecutionEvent::WorkflowPaused { node_id, .. } => {
            println!("⏸️  Workflow paused at {}", node_id);
        }
        ExecutionEvent::NodeStarted { node_id, node_type, .. } => {
            println!("  ⚡ Starting node: {} ({})", node_id, node_type);
        }
        ExecutionEvent::NodeCompleted { node_id, duration_ms, .. } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
            println!("  ⏭️  Node {} skipped: {}", node_id, reason);
        }
        ExecutionEvent::NodeWaiting { node_id, .. } => {
            println!("  ⏳ Node {} waiting", node_id);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {:.0}% - {}", node_id, percent, msg);
                } else {
                    println!("     📊 [{}] {:.0}%", node_id, percent);
                }
            }
        },
        ExecutionEvent::WorkflowCompleted { status, duration_ms, .. } => match status {
            ExecutionStatus::Completed => println!("✨ Workflow completed successfully in {}ms", duration_ms),
            other => println!("💥 Workflow ended {:?} after {}ms", other, duration_ms),
        },
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let definition = load_definition(file)?;
    validate_graph(&definition.graph)?;

    let runtime = runtime();
    let unknown: Vec<_> = definition
        .graph
        .nodes
        .iter()
        .filter(|n| !runtime.registry().contains(&n.node_type))
        .map(|n| format!("{} ({})", n.id, n.node_type))
        .collect();
    if !unknown.is_empty() {
        bail!("unknown node types: {}", unknown.join(", "));
    }

    println!("✅ Workflow is valid:");
    println!("   Id: {}", definition.id);
    println!("   Name: {}", definition.name);
    println!("   Nodes: {}", definition.graph.nodes.len());
    println!("   Edges: {}", definition.graph.edges.len());

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let runtime = runtime();
    let registry = runtime.registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut graph = Graph::new();
    graph.add_node(
        NodeSpec::new("start", node_types::START).with_config(
            "variables",
            Value::from(serde_json::json!([{"name": "amount", "type": "number", "defaultValue": 250}])),
        ),
    );
    graph.add_node(
        NodeSpec::new("fee", node_types::TRANSFORM)
            .with_label("Compute fee")
            .with_config(
                "mappings",
                Value::from(serde_json::json!([{"target": "fee", "expression": "{{input.amount}} * 0.02"}])),
            ),
    );
    graph.add_node(
        NodeSpec::new("large", node_types::CONDITION)
            .with_label("Large order?")
            .with_config("expression", "{{input.amount}} > 100"),
    );
    graph.add_node(
        NodeSpec::new("review", node_types::VARIABLE_ASSIGNER).with_config(
            "assignments",
            Value::from(serde_json::json!([{"variableName": "decision", "mode": "set", "value": "manual review"}])),
        ),
    );
    graph.add_node(
        NodeSpec::new("approve", node_types::VARIABLE_ASSIGNER).with_config(
            "assignments",
            Value::from(serde_json::json!([{"variableName": "decision", "mode": "set", "value": "auto approved"}])),
        ),
    );
    graph.add_node(NodeSpec::new("end", node_types::END).with_config(
        "outputVariables",
        Value::from(serde_json::json!([
            {"name": "fee", "expression": "{{nodes.fee.fee}}", "type": "number"},
            {"name": "decision", "expression": "{{var.decision}}"}
        ])),
    ));
    graph.connect("start", "fee");
    graph.connect("fee", "large");
    graph.connect_handle("large", "true", "review");
    graph.connect_handle("large", "false", "approve");
    graph.connect("review", "end");
    graph.connect("approve", "end");

    let mut definition = FlowDefinition::new("example", graph).with_name("Example Order Workflow");
    definition.description = Some("Computes a fee and routes large orders to review".to_string());

    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {} --input '{{\"amount\": 80}}'", output.display());

    Ok(())
}
