use flowcore::{node_types, Graph, WorkflowError};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Structural checks run when a definition is published: exactly one start
/// node, unique node ids, edges between known nodes and no cycles.
pub fn validate_graph(graph: &Graph) -> Result<(), WorkflowError> {
    let starts = graph
        .nodes
        .iter()
        .filter(|n| n.node_type == node_types::START)
        .count();
    match starts {
        0 => return Err(WorkflowError::MissingStartNode),
        1 => {}
        n => return Err(WorkflowError::Invalid(format!("expected one start node, found {}", n))),
    }

    let dag = build_graph(graph)?;
    if toposort(&dag, None).is_err() {
        return Err(WorkflowError::CyclicDependency);
    }
    Ok(())
}

/// Build a petgraph view of the node/edge lists
fn build_graph(graph: &Graph) -> Result<DiGraph<&str, ()>, WorkflowError> {
    let mut dag = DiGraph::new();
    let mut node_to_index: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &graph.nodes {
        let idx = dag.add_node(node.id.as_str());
        if node_to_index.insert(node.id.as_str(), idx).is_some() {
            return Err(WorkflowError::Invalid(format!("duplicate node id: {}", node.id)));
        }
    }

    for edge in &graph.edges {
        let from = node_to_index
            .get(edge.source.as_str())
            .ok_or_else(|| WorkflowError::InvalidConnection(format!("unknown source node: {}", edge.source)))?;
        let to = node_to_index
            .get(edge.target.as_str())
            .ok_or_else(|| WorkflowError::InvalidConnection(format!("unknown target node: {}", edge.target)))?;
        dag.add_edge(*from, *to, ());
    }

    Ok(dag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::NodeSpec;

    fn linear() -> Graph {
        let mut graph = Graph::new();
        graph.add_node(NodeSpec::new("s", node_types::START));
        graph.add_node(NodeSpec::new("t", node_types::TRANSFORM));
        graph.add_node(NodeSpec::new("e", node_types::END));
        graph.connect("s", "t");
        graph.connect("t", "e");
        graph
    }

    #[test]
    fn accepts_linear_graph() {
        assert!(validate_graph(&linear()).is_ok());
    }

    #[test]
    fn rejects_cycles_and_dangling_edges() {
        let mut cyclic = linear();
        cyclic.connect("e", "t");
        assert!(matches!(validate_graph(&cyclic), Err(WorkflowError::CyclicDependency)));

        let mut dangling = linear();
        dangling.connect("t", "ghost");
        assert!(matches!(validate_graph(&dangling), Err(WorkflowError::InvalidConnection(_))));
    }

    #[test]
    fn requires_a_single_start() {
        let mut graph = Graph::new();
        graph.add_node(NodeSpec::new("e", node_types::END));
        assert!(matches!(validate_graph(&graph), Err(WorkflowError::MissingStartNode)));
    }
}
