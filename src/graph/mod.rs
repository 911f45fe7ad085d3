//! Graph topology and chain identity.
//!
//! A chain is only meaningful against the graph it was recorded on. The graph
//! hash is a fingerprint of the adjacency structure that is stored in the
//! chain's metadata and checked before replay.

mod hash;

pub use hash::{compute_graph_hash, GraphHash};

use crate::error::{ChainError, Result};
use crate::types::NodeId;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

/// Undirected graph over integer node ids.
///
/// Adjacency is kept in ordered collections so iteration order never depends
/// on construction order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Graph {
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph with nodes `0..n` and no edges.
    pub fn with_nodes(n: usize) -> Self {
        let mut graph = Self::new();
        for node in 0..n {
            graph.add_node(node);
        }
        graph
    }

    /// A graph with nodes `0..n` and the given edges.
    pub fn from_edges(n: usize, edges: impl IntoIterator<Item = (NodeId, NodeId)>) -> Self {
        let mut graph = Self::with_nodes(n);
        for (u, v) in edges {
            graph.add_edge(u, v);
        }
        graph
    }

    /// Load a graph from networkx adjacency-data JSON.
    ///
    /// Only the `id` of each entry in `nodes` and the `id` of each neighbour in
    /// `adjacency` are read; node attributes are ignored.
    pub fn from_adjacency_json(reader: impl Read) -> Result<Self> {
        #[derive(Deserialize)]
        struct Entry {
            id: NodeId,
        }

        #[derive(Deserialize)]
        struct AdjacencyData {
            nodes: Vec<Entry>,
            adjacency: Vec<Vec<Entry>>,
        }

        let data: AdjacencyData = serde_json::from_reader(reader)?;
        if data.nodes.len() != data.adjacency.len() {
            return Err(ChainError::InvalidGraph(format!(
                "{} nodes but {} adjacency lists",
                data.nodes.len(),
                data.adjacency.len()
            )));
        }

        let mut graph = Self::new();
        for (node, neighbours) in data.nodes.iter().zip(&data.adjacency) {
            graph.add_node(node.id);
            for neighbour in neighbours {
                graph.add_edge(node.id, neighbour.id);
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, node: NodeId) {
        self.adjacency.entry(node).or_default();
    }

    /// Add an undirected edge, creating missing endpoints.
    pub fn add_edge(&mut self, u: NodeId, v: NodeId) {
        self.adjacency.entry(u).or_default().insert(v);
        self.adjacency.entry(v).or_default().insert(u);
    }

    /// Returns whether the edge existed.
    pub fn remove_edge(&mut self, u: NodeId, v: NodeId) -> bool {
        let removed = self
            .adjacency
            .get_mut(&u)
            .map(|n| n.remove(&v))
            .unwrap_or(false);
        if let Some(n) = self.adjacency.get_mut(&v) {
            n.remove(&u);
        }
        removed
    }

    /// Remove a node and its incident edges. Returns whether it existed.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        let Some(neighbours) = self.adjacency.remove(&node) else {
            return false;
        };
        for neighbour in neighbours {
            if let Some(n) = self.adjacency.get_mut(&neighbour) {
                n.remove(&node);
            }
        }
        true
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.adjacency.contains_key(&node)
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        let ends: usize = self.adjacency.values().map(BTreeSet::len).sum();
        let loops = self
            .adjacency
            .iter()
            .filter(|(node, n)| n.contains(node))
            .count();
        (ends + loops) / 2
    }

    /// Nodes in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.adjacency.keys().copied()
    }

    /// Neighbours of `node` in ascending order.
    pub fn neighbours(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.adjacency
            .get(&node)
            .into_iter()
            .flat_map(|n| n.iter().copied())
    }

    /// True if the nodes are exactly `0..node_count()`.
    pub fn is_dense(&self) -> bool {
        self.adjacency
            .keys()
            .enumerate()
            .all(|(expected, &node)| expected == node)
    }

    /// Fail unless partitions of this graph can be indexed by node id.
    pub(crate) fn require_dense(&self) -> Result<()> {
        if self.adjacency.is_empty() {
            return Err(ChainError::InvalidGraph("graph has no nodes".into()));
        }
        if !self.is_dense() {
            return Err(ChainError::InvalidGraph(format!(
                "node ids must be exactly 0..{}",
                self.node_count()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_are_undirected() {
        let mut graph = Graph::with_nodes(3);
        graph.add_edge(0, 1);
        graph.add_edge(2, 1);

        assert_eq!(graph.neighbours(1).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(graph.edge_count(), 2);

        assert!(graph.remove_edge(1, 0));
        assert!(!graph.remove_edge(1, 0));
        assert_eq!(graph.neighbours(0).count(), 0);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut graph = Graph::from_edges(3, [(0, 1), (1, 2)]);
        assert!(graph.remove_node(1));
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 0);
        assert!(!graph.is_dense());
    }

    #[test]
    fn test_require_dense() {
        assert!(Graph::with_nodes(4).require_dense().is_ok());
        assert!(Graph::new().require_dense().is_err());

        let mut sparse = Graph::new();
        sparse.add_node(1);
        assert!(matches!(
            sparse.require_dense(),
            Err(ChainError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_from_adjacency_json() {
        let json = r#"{
            "directed": false,
            "multigraph": false,
            "graph": [],
            "nodes": [{"id": 0, "TOTPOP": 10}, {"id": 1}, {"id": 2}],
            "adjacency": [[{"id": 1}], [{"id": 0}, {"id": 2}], [{"id": 1}]]
        }"#;
        let graph = Graph::from_adjacency_json(json.as_bytes()).unwrap();
        assert_eq!(graph, Graph::from_edges(3, [(0, 1), (1, 2)]));
    }

    #[test]
    fn test_from_adjacency_json_length_mismatch() {
        let json = r#"{"nodes": [{"id": 0}], "adjacency": []}"#;
        assert!(matches!(
            Graph::from_adjacency_json(json.as_bytes()),
            Err(ChainError::InvalidGraph(_))
        ));
    }
}
