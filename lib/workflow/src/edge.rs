//! Edge types for DAG workflows.
//!
//! An edge is an ordered pair of node ids with an optional activation
//! condition and an optional mapping from source output names to target
//! input names.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A directed edge between two nodes of the same workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID.
    #[serde(alias = "from")]
    pub source: NodeId,
    /// Target node ID.
    #[serde(alias = "to")]
    pub target: NodeId,
    /// Optional activation condition (a branch id for Switch sources, or a
    /// predicate over context variables).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Source output name -> target input name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_mapping: BTreeMap<String, String>,
}

impl Edge {
    /// Creates an unconditional edge.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            data_mapping: BTreeMap::new(),
        }
    }

    /// Sets the activation condition.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Adds a data mapping entry.
    #[must_use]
    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.data_mapping.insert(from.into(), to.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_creation() {
        let edge = Edge::new("a", "b");
        assert_eq!(edge.source.as_str(), "a");
        assert_eq!(edge.target.as_str(), "b");
        assert!(edge.condition.is_none());
    }

    #[test]
    fn edge_from_to_aliases() {
        let edge: Edge = serde_json::from_str(r#"{"from": "a", "to": "b"}"#).expect("deserialize");
        assert_eq!(edge.source.as_str(), "a");
        assert_eq!(edge.target.as_str(), "b");
    }

    #[test]
    fn edge_serde_roundtrip() {
        let edge = Edge::new("a", "b")
            .with_condition("high")
            .with_mapping("result", "input");
        let json = serde_json::to_string(&edge).expect("serialize");
        let parsed: Edge = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(edge, parsed);
    }
}
