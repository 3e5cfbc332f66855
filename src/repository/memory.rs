//! In-memory repository for tests and embedded use

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::graph::{Graph, GraphId, NodeId};
use crate::model::{Execution, ExecutionId, ExecutionStatus, NodeExecution, NodeExecutionId};
use crate::value::{Value, ValueMap};

use super::{ExecutionForRun, Repository, RepositoryError};

/// In-memory [`Repository`] backed by concurrent maps.
///
/// Row-level atomicity comes from the per-entry locks of the underlying
/// maps; the status CAS is evaluated while the entry lock is held.
#[derive(Default)]
pub struct MemoryRepository {
    graphs: DashMap<GraphId, Graph>,
    executions: DashMap<ExecutionId, Execution>,
    node_executions: DashMap<NodeExecutionId, NodeExecution>,
    by_execution: DashMap<ExecutionId, Vec<NodeExecutionId>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a single node execution row, for observers and tests.
    pub fn node_execution(&self, id: NodeExecutionId) -> Option<NodeExecution> {
        self.node_executions.get(&id).map(|e| e.value().clone())
    }

    /// Read an execution row, for observers and tests.
    pub fn execution(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.get(&id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_graph(&self, graph: Graph) -> Result<(), RepositoryError> {
        self.graphs.insert(graph.id, graph);
        Ok(())
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), RepositoryError> {
        if !self.graphs.contains_key(&execution.graph_id) {
            return Err(RepositoryError::GraphNotFound(execution.graph_id));
        }
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn load_execution_for_run(
        &self,
        id: ExecutionId,
    ) -> Result<ExecutionForRun, RepositoryError> {
        let execution = self
            .executions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(RepositoryError::ExecutionNotFound(id))?;
        let graph = self
            .graphs
            .get(&execution.graph_id)
            .map(|g| g.value().clone())
            .ok_or(RepositoryError::GraphNotFound(execution.graph_id))?;
        Ok(ExecutionForRun { execution, graph })
    }

    async fn set_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut row = self
            .executions
            .get_mut(&id)
            .ok_or(RepositoryError::ExecutionNotFound(id))?;
        if !row.status.can_transition_to(status) {
            return Err(RepositoryError::InvalidTransition {
                from: row.status,
                to: status,
            });
        }
        row.status = status;
        if let Some(at) = started_at {
            row.started_at = Some(at);
        }
        if let Some(at) = completed_at {
            row.completed_at = Some(at);
        }
        if error_message.is_some() {
            row.error_message = error_message;
        }
        Ok(())
    }

    async fn create_node_executions(
        &self,
        execution_id: ExecutionId,
        node_ids: &[NodeId],
    ) -> Result<HashMap<String, NodeExecutionId>, RepositoryError> {
        let execution = self
            .executions
            .get(&execution_id)
            .map(|e| e.value().clone())
            .ok_or(RepositoryError::ExecutionNotFound(execution_id))?;
        let graph = self
            .graphs
            .get(&execution.graph_id)
            .map(|g| g.value().clone())
            .ok_or(RepositoryError::GraphNotFound(execution.graph_id))?;

        let mut map = HashMap::with_capacity(node_ids.len());
        let mut ids = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let node = graph
                .nodes
                .iter()
                .find(|n| n.id == *node_id)
                .ok_or(RepositoryError::NodeNotFound(*node_id))?;
            let row = NodeExecution::new(execution_id, *node_id);
            map.insert(node.node_key.clone(), row.id);
            ids.push(row.id);
            self.node_executions.insert(row.id, row);
        }
        self.by_execution.insert(execution_id, ids);
        Ok(map)
    }

    async fn start_node_execution(
        &self,
        id: NodeExecutionId,
        runner_task_id: &str,
        input_data: ValueMap,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut row = self
            .node_executions
            .get_mut(&id)
            .ok_or(RepositoryError::NodeExecutionNotFound(id))?;
        if !row.status.can_transition_to(ExecutionStatus::Running) {
            return Err(RepositoryError::InvalidTransition {
                from: row.status,
                to: ExecutionStatus::Running,
            });
        }
        row.status = ExecutionStatus::Running;
        row.runner_task_id = Some(runner_task_id.to_string());
        row.input_data = Some(input_data);
        row.started_at = Some(at);
        Ok(())
    }

    async fn complete_node_execution(
        &self,
        id: NodeExecutionId,
        status: ExecutionStatus,
        output_data: Option<Value>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut row = self
            .node_executions
            .get_mut(&id)
            .ok_or(RepositoryError::NodeExecutionNotFound(id))?;
        if !status.is_terminal() || !row.status.can_transition_to(status) {
            return Err(RepositoryError::InvalidTransition {
                from: row.status,
                to: status,
            });
        }
        row.status = status;
        row.output_data = output_data;
        row.error_message = error_message;
        row.completed_at = Some(at);
        Ok(())
    }

    async fn list_terminal_node_executions(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let ids = self
            .by_execution
            .get(&execution_id)
            .map(|v| v.value().clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.node_executions.get(id))
            .filter(|row| row.status.is_terminal())
            .map(|row| row.value().clone())
            .collect())
    }

    async fn terminal_statuses_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<HashMap<NodeId, ExecutionStatus>, RepositoryError> {
        Ok(self
            .list_terminal_node_executions(execution_id)
            .await?
            .into_iter()
            .map(|row| (row.node_id, row.status))
            .collect())
    }
}
