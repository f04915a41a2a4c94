//! Dependency graph over workflow nodes, built on petgraph.
//!
//! The graph merges explicit edges and node dependencies into a single
//! directed graph used for cycle detection, Kahn layering (parallel groups),
//! and up/downstream queries.

use crate::definition::Workflow;
use crate::node::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// A directed dependency graph over node ids.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// The underlying directed graph. Node weights are NodeIds.
    graph: DiGraph<NodeId, ()>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    index: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph from a workflow's nodes, edges, and dependencies.
    ///
    /// Parallel edges between the same pair are collapsed so that in-degree
    /// counts match dependency counts.
    #[must_use]
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &workflow.nodes {
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        let mut seen: HashSet<(NodeId, NodeId)> = HashSet::new();
        let mut connect = |graph: &mut DiGraph<NodeId, ()>, source: &NodeId, target: &NodeId| {
            let (Some(&source_idx), Some(&target_idx)) = (index.get(source), index.get(target))
            else {
                return;
            };
            if seen.insert((source.clone(), target.clone())) {
                graph.add_edge(source_idx, target_idx, ());
            }
        };

        for edge in &workflow.edges {
            connect(&mut graph, &edge.source, &edge.target);
        }
        for node in &workflow.nodes {
            for dep in &node.dependencies {
                connect(&mut graph, dep, &node.id);
            }
        }

        Self { graph, index }
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of (deduplicated) edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the direct successors of a node.
    #[must_use]
    pub fn successors(&self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect()
    }

    /// Returns the direct predecessors of a node.
    #[must_use]
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect()
    }

    /// Returns nodes with no incoming edges.
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    /// Detects a cycle via iterative Kahn elimination.
    ///
    /// Returns the first cycle found as a node path ending where it started,
    /// or `None` if the graph is acyclic. The walk starts from the smallest
    /// remaining node id so the reported cycle is deterministic.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&idx, _)| idx)
            .collect();
        let mut visited = 0usize;

        while let Some(idx) = queue.pop_front() {
            visited += 1;
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let degree = in_degree.get_mut(&next).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited == self.graph.node_count() {
            return None;
        }

        // Remaining nodes with nonzero in-degree lie on or behind a cycle.
        // Prune nodes with no successor inside the set (tails hanging off a
        // cycle) until only cyclic cores are left.
        let mut remaining: HashSet<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(&idx, _)| idx)
            .collect();
        loop {
            let tails: Vec<NodeIndex> = remaining
                .iter()
                .filter(|&&idx| {
                    !self
                        .graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .any(|next| remaining.contains(&next))
                })
                .copied()
                .collect();
            if tails.is_empty() {
                break;
            }
            for idx in tails {
                remaining.remove(&idx);
            }
        }

        let start = remaining
            .iter()
            .min_by_key(|&&idx| self.graph.node_weight(idx))
            .copied()?;

        // Walk successors inside the remaining set until a node repeats;
        // the path from its first occurrence is the cycle.
        let mut path = Vec::new();
        let mut positions: HashMap<NodeIndex, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&at) = positions.get(&current) {
                let mut cycle: Vec<NodeId> = path[at..]
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx).cloned())
                    .collect();
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                return Some(cycle);
            }
            positions.insert(current, path.len());
            path.push(current);
            current = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|next| remaining.contains(next))
                .min_by_key(|&idx| self.graph.node_weight(idx))?;
        }
    }

    /// Computes Kahn layers: nodes sharing a layer have no dependency
    /// ordering between them and may run in parallel.
    ///
    /// Returns an empty vector when the graph is cyclic.
    #[must_use]
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut layers = Vec::new();
        let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let mut layer: Vec<NodeIndex> = remaining
                .iter()
                .filter(|idx| in_degree[idx] == 0)
                .copied()
                .collect();
            if layer.is_empty() {
                // Cyclic remainder; layering is undefined.
                return Vec::new();
            }
            layer.sort_by_key(|&idx| self.graph.node_weight(idx).cloned());

            for &idx in &layer {
                remaining.remove(&idx);
                for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&next) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            layers.push(
                layer
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).cloned())
                    .collect(),
            );
        }

        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::Node;

    fn diamond() -> Workflow {
        // a -> b, a -> c, b -> d, c -> d
        Workflow::new("wf")
            .with_node(Node::agent("a", "echo"))
            .with_node(Node::agent("b", "echo").with_dependency("a"))
            .with_node(Node::agent("c", "echo").with_dependency("a"))
            .with_node(
                Node::agent("d", "echo")
                    .with_dependency("b")
                    .with_dependency("c"),
            )
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("a", "c"))
            .with_edge(Edge::new("b", "d"))
            .with_edge(Edge::new("c", "d"))
    }

    #[test]
    fn parallel_edges_are_collapsed() {
        // Edges both explicit and implied by dependencies.
        let graph = DependencyGraph::from_workflow(&diamond());
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 4);
    }

    #[test]
    fn entry_nodes_have_no_predecessors() {
        let graph = DependencyGraph::from_workflow(&diamond());
        assert_eq!(graph.entry_nodes(), vec![NodeId::new("a")]);
    }

    #[test]
    fn successors_and_predecessors() {
        let graph = DependencyGraph::from_workflow(&diamond());
        let mut succ = graph.successors(&NodeId::new("a"));
        succ.sort();
        assert_eq!(succ, vec![NodeId::new("b"), NodeId::new("c")]);
        let mut pred = graph.predecessors(&NodeId::new("d"));
        pred.sort();
        assert_eq!(pred, vec![NodeId::new("b"), NodeId::new("c")]);
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let graph = DependencyGraph::from_workflow(&diamond());
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn cycle_is_detected_and_named() {
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo"))
            .with_node(Node::agent("b", "echo"))
            .with_node(Node::agent("c", "echo"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c"))
            .with_edge(Edge::new("c", "b"));
        let graph = DependencyGraph::from_workflow(&workflow);
        let cycle = graph.find_cycle().expect("cycle");
        // b -> c -> b
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() >= 3);
    }

    #[test]
    fn layers_group_parallel_nodes() {
        let graph = DependencyGraph::from_workflow(&diamond());
        let layers = graph.layers();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec![NodeId::new("a")]);
        assert_eq!(layers[1], vec![NodeId::new("b"), NodeId::new("c")]);
        assert_eq!(layers[2], vec![NodeId::new("d")]);
    }

    #[test]
    fn layers_empty_for_cyclic_graph() {
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo"))
            .with_node(Node::agent("b", "echo"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let graph = DependencyGraph::from_workflow(&workflow);
        assert!(graph.layers().is_empty());
    }
}
