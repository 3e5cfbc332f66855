//! Static graph analysis
//!
//! [`GraphAnalyzer`] is built once from a graph's nodes and edges and is
//! pure thereafter: structural validation, cycle detection, topological
//! ordering, level partitioning for the scheduler's fan-in barriers, and
//! predecessor/successor lookups.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use super::{Edge, EdgeCondition, GraphError, Node};

/// Pure, stateless analysis over a graph's `(nodes, edges)`.
#[derive(Debug, Clone)]
pub struct GraphAnalyzer {
    /// Node keys in declaration order; ties in orderings resolve by this
    node_order: Vec<String>,
    /// node_key -> declaration index
    node_index: HashMap<String, usize>,
    /// node_key -> [(successor_key, condition)]
    successors: HashMap<String, Vec<(String, EdgeCondition)>>,
    /// node_key -> [(predecessor_key, condition)]
    predecessors: HashMap<String, Vec<(String, EdgeCondition)>>,
    /// Structural digraph over known node keys
    digraph: DiGraph<(), ()>,
    /// First structural defect found while building, reported by validate
    defect: Option<GraphError>,
}

impl GraphAnalyzer {
    /// Build an analyzer from a graph's nodes and edges.
    ///
    /// Construction never fails; structural defects are reported by
    /// [`GraphAnalyzer::validate`] so callers can surface the reason.
    pub fn new(nodes: &[Node], edges: &[Edge]) -> Self {
        let node_order: Vec<String> = nodes.iter().map(|n| n.node_key.clone()).collect();
        let node_index: HashMap<String, usize> = node_order
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();

        let mut digraph = DiGraph::new();
        let petgraph_index: HashMap<String, NodeIndex> = node_order
            .iter()
            .map(|k| (k.clone(), digraph.add_node(())))
            .collect();

        let mut defect = None;
        if nodes.is_empty() {
            defect = Some(GraphError::Empty);
        }
        for node in nodes {
            if defect.is_none() && node.timeout_seconds == 0 {
                defect = Some(GraphError::InvalidTimeout(node.node_key.clone()));
            }
        }

        let mut successors: HashMap<String, Vec<(String, EdgeCondition)>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<(String, EdgeCondition)>> = HashMap::new();
        let mut seen_edges: HashSet<(String, String, EdgeCondition)> = HashSet::new();

        for edge in edges {
            let known_source = node_index.contains_key(&edge.source);
            let known_target = node_index.contains_key(&edge.target);
            if defect.is_none() {
                if !known_source {
                    defect = Some(GraphError::UnknownNodeKey(edge.source.clone()));
                } else if !known_target {
                    defect = Some(GraphError::UnknownNodeKey(edge.target.clone()));
                } else if edge.source == edge.target {
                    defect = Some(GraphError::SelfLoop(edge.source.clone()));
                } else if !seen_edges.insert((
                    edge.source.clone(),
                    edge.target.clone(),
                    edge.condition,
                )) {
                    defect = Some(GraphError::DuplicateEdge {
                        edge_source: edge.source.clone(),
                        target: edge.target.clone(),
                        condition: edge.condition,
                    });
                }
            }
            if !known_source || !known_target || edge.source == edge.target {
                continue;
            }

            successors
                .entry(edge.source.clone())
                .or_default()
                .push((edge.target.clone(), edge.condition));
            predecessors
                .entry(edge.target.clone())
                .or_default()
                .push((edge.source.clone(), edge.condition));
            digraph.add_edge(
                petgraph_index[&edge.source],
                petgraph_index[&edge.target],
                (),
            );
        }

        Self {
            node_order,
            node_index,
            successors,
            predecessors,
            digraph,
            defect,
        }
    }

    /// Validate the graph: non-empty, all edge endpoints known, no
    /// self-loops, no duplicate `(source, target, condition)` edges,
    /// positive timeouts, acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        if let Some(defect) = &self.defect {
            return Err(defect.clone());
        }
        if self.has_cycle() {
            return Err(GraphError::CycleDetected);
        }
        Ok(())
    }

    /// True if the directed graph contains a cycle.
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.digraph)
    }

    /// Topological order of node keys via Kahn's algorithm.
    ///
    /// Ties resolve by node declaration order, so the result is stable
    /// across runs. Fails on cyclic graphs.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree = self.in_degrees();
        // Min-heap over declaration indices keeps ties deterministic.
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| Reverse(self.node_index[k]))
            .collect();

        let mut order = Vec::with_capacity(self.node_order.len());
        while let Some(Reverse(idx)) = ready.pop() {
            let key = &self.node_order[idx];
            order.push(key.clone());
            for (succ, _) in self.successors.get(key).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.node_index[succ]));
                    }
                }
            }
        }

        if order.len() != self.node_order.len() {
            return Err(GraphError::CycleDetected);
        }
        Ok(order)
    }

    /// Partition nodes into longest-path layers.
    ///
    /// `L0` holds nodes with no predecessors; `L(i+1)` holds nodes whose
    /// every predecessor lies in an earlier level. Each level is in node
    /// declaration order. Fails on cyclic graphs.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<String> = self
            .node_order
            .iter()
            .filter(|k| in_degree[*k] == 0)
            .cloned()
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;
        while !current.is_empty() {
            placed += current.len();
            let mut next: Vec<String> = Vec::new();
            for key in &current {
                for (succ, _) in self.successors.get(key).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(degree) = in_degree.get_mut(succ) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(succ.clone());
                        }
                    }
                }
            }
            next.sort_by_key(|k| self.node_index[k]);
            levels.push(std::mem::replace(&mut current, next));
        }

        if placed != self.node_order.len() {
            return Err(GraphError::CycleDetected);
        }
        Ok(levels)
    }

    /// Predecessors of `node_key` with the condition on the connecting edge.
    pub fn predecessors(&self, node_key: &str) -> &[(String, EdgeCondition)] {
        self.predecessors
            .get(node_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Successors of `node_key` with the condition on the connecting edge.
    pub fn successors(&self, node_key: &str) -> &[(String, EdgeCondition)] {
        self.successors
            .get(node_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The declared condition on the `source -> target` edge, if any.
    pub fn edge_condition(&self, source: &str, target: &str) -> Option<EdgeCondition> {
        self.successors
            .get(source)?
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, c)| *c)
    }

    /// Node keys in declaration order.
    pub fn node_keys(&self) -> &[String] {
        &self.node_order
    }

    fn in_degrees(&self) -> HashMap<String, usize> {
        self.node_order
            .iter()
            .map(|k| {
                let d = self.predecessors.get(k).map(Vec::len).unwrap_or(0);
                (k.clone(), d)
            })
            .collect()
    }
}
