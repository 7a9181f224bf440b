use crate::error::{EngineError, EngineResult};
use crate::types::{Edge, EdgeId, Node, NodeId, WorkflowGraph};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

/// Validated, indexed view of a submitted graph
pub struct WorkflowDag {
    graph: DiGraph<NodeId, EdgeId>,
    node_indices: HashMap<NodeId, NodeIndex>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    // Edge positions per node, in declaration order
    incoming: HashMap<NodeId, Vec<usize>>,
    outgoing: HashMap<NodeId, Vec<usize>>,
}

impl WorkflowDag {
    /// Validate a graph and build its adjacency
    pub fn from_graph(workflow: &WorkflowGraph) -> EngineResult<Self> {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();

        for node in &workflow.nodes {
            if node_indices.contains_key(&node.id) {
                return Err(EngineError::MalformedGraph(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            let idx = graph.add_node(node.id.clone());
            node_indices.insert(node.id.clone(), idx);
            incoming.insert(node.id.clone(), Vec::new());
            outgoing.insert(node.id.clone(), Vec::new());
        }

        let nodes_by_id: HashMap<&NodeId, &Node> =
            workflow.nodes.iter().map(|n| (&n.id, n)).collect();
        let mut edge_ids = HashSet::new();

        for (position, edge) in workflow.edges.iter().enumerate() {
            if !edge_ids.insert(&edge.id) {
                return Err(EngineError::MalformedGraph(format!(
                    "duplicate edge id {}",
                    edge.id
                )));
            }

            let source = nodes_by_id.get(&edge.source_node_id).ok_or_else(|| {
                EngineError::MalformedGraph(format!(
                    "edge {} references unknown source node {}",
                    edge.id, edge.source_node_id
                ))
            })?;
            let target = nodes_by_id.get(&edge.target_node_id).ok_or_else(|| {
                EngineError::MalformedGraph(format!(
                    "edge {} references unknown target node {}",
                    edge.id, edge.target_node_id
                ))
            })?;

            if !source.declared_outputs.contains(&edge.source_port) {
                return Err(EngineError::MalformedGraph(format!(
                    "edge {} references unknown output port {}.{}",
                    edge.id, source.id, edge.source_port
                )));
            }
            if !target.declared_inputs.contains(&edge.target_port) {
                return Err(EngineError::MalformedGraph(format!(
                    "edge {} references unknown input port {}.{}",
                    edge.id, target.id, edge.target_port
                )));
            }

            graph.add_edge(
                node_indices[&edge.source_node_id],
                node_indices[&edge.target_node_id],
                edge.id.clone(),
            );
            outgoing
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(position);
            incoming
                .entry(edge.target_node_id.clone())
                .or_default()
                .push(position);
        }

        let dag = Self {
            graph,
            node_indices,
            nodes: workflow.nodes.clone(),
            edges: workflow.edges.clone(),
            incoming,
            outgoing,
        };

        // A graph without entry points is always cyclic; report the former
        if dag.entry_nodes().is_empty() {
            return Err(EngineError::NoEntryPoint);
        }

        if petgraph::algo::is_cyclic_directed(&dag.graph) {
            return Err(EngineError::MalformedGraph(
                "graph contains circular dependencies".to_string(),
            ));
        }

        Ok(dag)
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Edges in declaration order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.node_indices
            .get(node_id)
            .map(|idx| &self.nodes[idx.index()])
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_indices.contains_key(node_id)
    }

    /// Nodes with no incoming edges, in declaration order
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| self.incoming.get(&n.id).map_or(true, |e| e.is_empty()))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn incoming_edges(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edge_list(self.incoming.get(node_id))
    }

    pub fn outgoing_edges(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edge_list(self.outgoing.get(node_id))
    }

    /// Distinct upstream nodes, in edge declaration order
    pub fn dependencies(&self, node_id: &NodeId) -> Vec<NodeId> {
        distinct(
            self.incoming_edges(node_id)
                .into_iter()
                .map(|e| e.source_node_id.clone()),
        )
    }

    /// Distinct downstream nodes, in edge declaration order
    pub fn dependents(&self, node_id: &NodeId) -> Vec<NodeId> {
        distinct(
            self.outgoing_edges(node_id)
                .into_iter()
                .map(|e| e.target_node_id.clone()),
        )
    }

    /// Every node reachable from `node_id`, excluding itself
    pub fn descendants(&self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(&start) = self.node_indices.get(node_id) else {
            return Vec::new();
        };

        let mut bfs = Bfs::new(&self.graph, start);
        let mut reached = Vec::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                reached.push(self.graph[idx].clone());
            }
        }
        reached
    }

    fn edge_list(&self, positions: Option<&Vec<usize>>) -> Vec<&Edge> {
        positions
            .map(|p| p.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }
}

fn distinct(ids: impl Iterator<Item = NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowGraph {
        WorkflowGraph {
            nodes: nodes.iter().map(|id| Node::new(*id, "transform")).collect(),
            edges: edges
                .iter()
                .enumerate()
                .map(|(i, (s, t))| Edge::new(format!("e{}", i), *s, *t))
                .collect(),
        }
    }

    #[test]
    fn test_linear_graph() {
        let dag = WorkflowDag::from_graph(&graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]))
            .unwrap();

        assert_eq!(dag.entry_nodes(), vec![NodeId::new("a")]);
        assert_eq!(dag.dependencies(&NodeId::new("c")), vec![NodeId::new("b")]);
        assert_eq!(dag.dependents(&NodeId::new("a")), vec![NodeId::new("b")]);
        assert_eq!(
            dag.descendants(&NodeId::new("a")),
            vec![NodeId::new("b"), NodeId::new("c")]
        );
    }

    #[test]
    fn test_dependents_follow_edge_order() {
        let dag = WorkflowDag::from_graph(&graph(
            &["root", "x", "y", "z"],
            &[("root", "z"), ("root", "x"), ("root", "y"), ("root", "x")],
        ))
        .unwrap();

        assert_eq!(
            dag.dependents(&NodeId::new("root")),
            vec![NodeId::new("z"), NodeId::new("x"), NodeId::new("y")]
        );
        assert_eq!(dag.outgoing_edges(&NodeId::new("root")).len(), 4);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let result = WorkflowDag::from_graph(&graph(&["a"], &[("a", "ghost")]));
        assert!(matches!(result, Err(EngineError::MalformedGraph(msg)) if msg.contains("ghost")));
    }

    #[test]
    fn test_unknown_port_rejected() {
        let mut g = graph(&["a", "b"], &[("a", "b")]);
        g.edges[0].target_port = "nope".to_string();

        let result = WorkflowDag::from_graph(&g);
        assert!(matches!(result, Err(EngineError::MalformedGraph(msg)) if msg.contains("b.nope")));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let result = WorkflowDag::from_graph(&graph(&["a", "a"], &[]));
        assert!(matches!(result, Err(EngineError::MalformedGraph(_))));
    }

    #[test]
    fn test_no_entry_point() {
        let result = WorkflowDag::from_graph(&graph(&["a", "b"], &[("a", "b"), ("b", "a")]));
        assert_eq!(result.err(), Some(EngineError::NoEntryPoint));

        let empty = WorkflowDag::from_graph(&WorkflowGraph::default());
        assert_eq!(empty.err(), Some(EngineError::NoEntryPoint));
    }

    #[test]
    fn test_cycle_behind_entry_rejected() {
        let result = WorkflowDag::from_graph(&graph(
            &["a", "b", "c"],
            &[("a", "b"), ("b", "c"), ("c", "b")],
        ));
        assert!(
            matches!(result, Err(EngineError::MalformedGraph(msg)) if msg.contains("circular"))
        );
    }
}
