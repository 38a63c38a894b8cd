//! DAG construction and topological ordering for workflow definitions.
//!
//! Built once per execution. A definition that fails here never reaches
//! a node handler.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::models::workflow::{NodeConnection, NodeDefinition, WorkflowDefinition};

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("connection references unknown node: {0}")]
    UnknownNodeReference(String),
    #[error("cycle detected in workflow")]
    CycleDetected,
    #[error("workflow has no nodes")]
    Empty,
}

#[derive(Debug)]
pub struct WorkflowGraph {
    nodes: HashMap<String, NodeDefinition>,
    outgoing: HashMap<String, Vec<NodeConnection>>,
    predecessors: HashMap<String, Vec<String>>,
    order: Vec<String>,
    roots: Vec<String>,
}

impl WorkflowGraph {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        if definition.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut nodes = HashMap::new();
        for node in &definition.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
        }

        let mut outgoing: HashMap<String, Vec<NodeConnection>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in &definition.nodes {
            in_degree.insert(node.id.as_str(), 0);
        }

        for connection in &definition.connections {
            if !nodes.contains_key(&connection.source_node_id) {
                return Err(GraphError::UnknownNodeReference(
                    connection.source_node_id.clone(),
                ));
            }
            if !nodes.contains_key(&connection.target_node_id) {
                return Err(GraphError::UnknownNodeReference(
                    connection.target_node_id.clone(),
                ));
            }
            outgoing
                .entry(connection.source_node_id.clone())
                .or_default()
                .push(connection.clone());
            predecessors
                .entry(connection.target_node_id.clone())
                .or_default()
                .push(connection.source_node_id.clone());
            *in_degree
                .entry(connection.target_node_id.as_str())
                .or_insert(0) += 1;
        }

        // Kahn's algorithm, seeded in definition order for stability.
        let mut remaining = in_degree.clone();
        let mut queue: VecDeque<&str> = definition
            .nodes
            .iter()
            .filter(|n| remaining.get(n.id.as_str()) == Some(&0))
            .map(|n| n.id.as_str())
            .collect();
        let roots: Vec<String> = queue.iter().map(|id| id.to_string()).collect();

        let mut order = Vec::with_capacity(definition.nodes.len());
        while let Some(node_id) = queue.pop_front() {
            order.push(node_id.to_string());
            if let Some(connections) = outgoing.get(node_id) {
                for connection in connections {
                    let degree = remaining
                        .get_mut(connection.target_node_id.as_str())
                        .expect("target verified above");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(connection.target_node_id.as_str());
                    }
                }
            }
        }

        if order.len() != definition.nodes.len() {
            return Err(GraphError::CycleDetected);
        }

        Ok(Self {
            nodes,
            outgoing,
            predecessors,
            order,
            roots,
        })
    }

    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn outgoing(&self, id: &str) -> &[NodeConnection] {
        self.outgoing.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Incoming connections of `id`, looked up through its predecessors.
    pub fn incoming(&self, id: &str) -> Vec<&NodeConnection> {
        self.predecessors(id)
            .iter()
            .flat_map(|source| {
                self.outgoing(source)
                    .iter()
                    .filter(|c| c.target_node_id == id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            node_type: "noop".to_string(),
            name: None,
            parameters: json!({}),
        }
    }

    fn edge(source: &str, target: &str) -> NodeConnection {
        NodeConnection {
            source_node_id: source.to_string(),
            source_handle: None,
            target_node_id: target.to_string(),
            target_handle: None,
        }
    }

    fn definition(nodes: Vec<NodeDefinition>, connections: Vec<NodeConnection>) -> WorkflowDefinition {
        WorkflowDefinition { nodes, connections }
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let def = definition(
            vec![node("a"), node("b"), node("c")],
            vec![edge("a", "b"), edge("b", "c")],
        );
        let graph = WorkflowGraph::build(&def).expect("valid dag");
        assert_eq!(graph.topological_order(), ["a", "b", "c"]);
        assert_eq!(graph.roots(), ["a"]);
    }

    #[test]
    fn diamond_keeps_predecessors_before_successors() {
        let def = definition(
            vec![node("a"), node("b"), node("c"), node("d")],
            vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        );
        let graph = WorkflowGraph::build(&def).expect("valid dag");
        let order = graph.topological_order();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(graph.predecessors("d").len(), 2);
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let def = definition(
            vec![node("a"), node("b")],
            vec![edge("a", "b"), edge("b", "a")],
        );
        assert_eq!(
            WorkflowGraph::build(&def).unwrap_err(),
            GraphError::CycleDetected
        );
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let def = definition(vec![node("a")], vec![edge("a", "a")]);
        assert_eq!(
            WorkflowGraph::build(&def).unwrap_err(),
            GraphError::CycleDetected
        );
    }

    #[test]
    fn duplicate_ids_and_ghost_edges_are_rejected() {
        let dup = definition(vec![node("a"), node("a")], vec![]);
        assert_eq!(
            WorkflowGraph::build(&dup).unwrap_err(),
            GraphError::DuplicateNodeId("a".into())
        );

        let ghost = definition(vec![node("a")], vec![edge("a", "ghost")]);
        assert_eq!(
            WorkflowGraph::build(&ghost).unwrap_err(),
            GraphError::UnknownNodeReference("ghost".into())
        );
    }

    #[test]
    fn empty_definition_is_rejected() {
        let def = definition(vec![], vec![]);
        assert_eq!(WorkflowGraph::build(&def).unwrap_err(), GraphError::Empty);
    }

    #[test]
    fn disconnected_nodes_are_all_roots() {
        let def = definition(vec![node("a"), node("b")], vec![]);
        let graph = WorkflowGraph::build(&def).expect("valid dag");
        assert_eq!(graph.roots().len(), 2);
    }
}
