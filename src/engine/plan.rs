//! The per-dispatch execution plan
//!
//! Built once when a scheduler takes ownership of an execution and shared
//! read-only with every worker of that execution. All mutable state stays
//! behind the repository; the plan carries no back-pointers.

use std::collections::HashMap;

use crate::graph::{Graph, GraphAnalyzer, Node, NodeId};
use crate::model::{ExecutionId, NodeExecutionId};
use crate::value::ValueMap;

/// Immutable materialisation of a graph for one execution.
#[derive(Debug)]
pub struct ExecutionPlan {
    /// The execution being driven
    pub execution_id: ExecutionId,
    /// The execution's immutable context
    pub context: ValueMap,
    /// The analyzed graph
    pub analyzer: GraphAnalyzer,
    /// Longest-path level partition, scheduling order
    pub levels: Vec<Vec<String>>,
    nodes_by_key: HashMap<String, Node>,
    keys_by_node_id: HashMap<NodeId, String>,
    node_exec_ids: HashMap<String, NodeExecutionId>,
}

impl ExecutionPlan {
    /// Assemble a plan from an analyzed graph and the freshly created
    /// node-execution id map.
    pub fn new(
        execution_id: ExecutionId,
        context: ValueMap,
        graph: &Graph,
        analyzer: GraphAnalyzer,
        levels: Vec<Vec<String>>,
        node_exec_ids: HashMap<String, NodeExecutionId>,
    ) -> Self {
        let nodes_by_key: HashMap<String, Node> = graph
            .nodes
            .iter()
            .map(|n| (n.node_key.clone(), n.clone()))
            .collect();
        let keys_by_node_id = graph
            .nodes
            .iter()
            .map(|n| (n.id, n.node_key.clone()))
            .collect();
        Self {
            execution_id,
            context,
            analyzer,
            levels,
            nodes_by_key,
            keys_by_node_id,
            node_exec_ids,
        }
    }

    /// The node behind a key. Callers only pass keys the analyzer
    /// validated, so the lookup is infallible within the scheduler.
    pub fn node(&self, node_key: &str) -> &Node {
        &self.nodes_by_key[node_key]
    }

    /// The node-execution row id for a node key.
    pub fn node_exec_id(&self, node_key: &str) -> NodeExecutionId {
        self.node_exec_ids[node_key]
    }

    /// The node key owning a node id, if it belongs to this plan.
    pub fn node_key_of(&self, node_id: NodeId) -> Option<&str> {
        self.keys_by_node_id.get(&node_id).map(String::as_str)
    }

    /// All node keys in declaration order.
    pub fn node_keys(&self) -> &[String] {
        self.analyzer.node_keys()
    }
}
