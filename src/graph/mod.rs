//! Graph definitions for DAG workflows
//!
//! A [`Graph`] owns a set of [`Node`]s and directed [`Edge`]s. Each edge
//! carries an [`EdgeCondition`] deciding whether the target runs after the
//! source succeeds, after it fails, or unconditionally. Graphs are
//! immutable for the purposes of execution; deactivating a graph stops new
//! submissions while in-flight executions run to completion.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{Value, ValueMap};

pub mod analyzer;

pub use analyzer::GraphAnalyzer;

/// Default per-node timeout when a node does not declare one.
pub const DEFAULT_NODE_TIMEOUT_SECONDS: u64 = 300;

/// Errors arising from graph structure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Graph has no nodes at all
    #[error("graph has no nodes")]
    Empty,

    /// An edge references a node key that is not part of the graph
    #[error("edge references unknown node key: {0}")]
    UnknownNodeKey(String),

    /// An edge points a node at itself
    #[error("self-loop on node: {0}")]
    SelfLoop(String),

    /// Two edges share source, target, and condition
    #[error("duplicate edge {edge_source} -> {target} ({condition})")]
    DuplicateEdge {
        /// Source node key
        edge_source: String,
        /// Target node key
        target: String,
        /// Shared condition
        condition: EdgeCondition,
    },

    /// The directed graph contains a cycle
    #[error("graph contains a cycle")]
    CycleDetected,

    /// A node declares a non-positive timeout
    #[error("node {0} has non-positive timeout")]
    InvalidTimeout(String),
}

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        pub struct $name(pub ::uuid::Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(::uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<::uuid::Uuid> for $name {
            fn from(id: ::uuid::Uuid) -> Self {
                Self(id)
            }
        }
    };
}

pub(crate) use id_newtype;

id_newtype!(
    /// Opaque identifier of a [`Graph`].
    GraphId
);
id_newtype!(
    /// Opaque identifier of a [`Node`].
    NodeId
);
id_newtype!(
    /// Opaque identifier of an [`Edge`].
    EdgeId
);

/// Condition attached to an edge, gating the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeCondition {
    /// Target runs only if the source ended `Success`
    OnSuccess,
    /// Target runs only if the source ended `Failed`
    OnFailure,
    /// Target runs regardless of the source's terminal status
    Always,
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeCondition::OnSuccess => "ON_SUCCESS",
            EdgeCondition::OnFailure => "ON_FAILURE",
            EdgeCondition::Always => "ALWAYS",
        };
        f.write_str(s)
    }
}

/// A unit of computation inside a graph.
///
/// `node_key` is the stable, graph-scoped handle used in edges and input
/// bundles. The payload is opaque to the engine and handed verbatim to the
/// node runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id
    pub id: NodeId,
    /// Owning graph
    pub graph_id: GraphId,
    /// Stable handle, unique within the graph
    pub node_key: String,
    /// Display name
    pub name: String,
    /// Opaque payload descriptor passed to the runner
    pub payload: Value,
    /// Static values available to every run of this node
    pub constants: ValueMap,
    /// Per-node timeout, must be positive
    pub timeout_seconds: u64,
}

impl Node {
    /// Create a node with the default timeout and empty constants.
    pub fn new(graph_id: GraphId, node_key: impl Into<String>, payload: Value) -> Self {
        let node_key = node_key.into();
        Self {
            id: NodeId::new(),
            graph_id,
            name: node_key.clone(),
            node_key,
            payload,
            constants: ValueMap::new(),
            timeout_seconds: DEFAULT_NODE_TIMEOUT_SECONDS,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the node constants.
    pub fn with_constants(mut self, constants: ValueMap) -> Self {
        self.constants = constants;
        self
    }

    /// Set the per-node timeout.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// A directed, conditional edge between two nodes of the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge id
    pub id: EdgeId,
    /// Owning graph
    pub graph_id: GraphId,
    /// Source node key
    pub source: String,
    /// Target node key
    pub target: String,
    /// Gating condition
    pub condition: EdgeCondition,
}

impl Edge {
    /// Create an edge between two node keys.
    pub fn new(
        graph_id: GraphId,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            id: EdgeId::new(),
            graph_id,
            source: source.into(),
            target: target.into(),
            condition,
        }
    }
}

/// A user-defined workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Graph id
    pub id: GraphId,
    /// Human name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Inactive graphs cannot start new executions
    pub is_active: bool,
    /// Nodes, in declaration order
    pub nodes: Vec<Node>,
    /// Edges
    pub edges: Vec<Edge>,
}

impl Graph {
    /// Create an empty, active graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId::new(),
            name: name.into(),
            description: None,
            is_active: true,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node, keyed by `node_key`, returning the graph for chaining.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge, returning the graph for chaining.
    pub fn with_edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        self.edges.push(Edge::new(self.id, source, target, condition));
        self
    }

    /// Look up a node by its key.
    pub fn node(&self, node_key: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_key == node_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_builder() {
        let graph = Graph::new("pipeline");
        let gid = graph.id;
        let graph = graph
            .with_node(Node::new(gid, "a", Value::Null))
            .with_node(Node::new(gid, "b", Value::Null).with_timeout_seconds(30))
            .with_edge("a", "b", EdgeCondition::OnSuccess);

        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.node("b").unwrap().timeout_seconds, 30);
        assert!(graph.node("missing").is_none());
    }

    #[test]
    fn test_edge_condition_display() {
        assert_eq!(EdgeCondition::OnSuccess.to_string(), "ON_SUCCESS");
        assert_eq!(EdgeCondition::Always.to_string(), "ALWAYS");
    }
}
