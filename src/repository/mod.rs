//! Durable storage behind the engine
//!
//! The engine persists executions and node executions through the
//! [`Repository`] trait and nothing else. All operations are atomic at the
//! row level; status updates are compare-and-swap against the monotonic
//! status machine and fail with [`RepositoryError::InvalidTransition`] on
//! illegal moves, which the scheduler uses as an idempotency guard against
//! duplicate dispatch.

mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::{PostgresConfig, PostgresRepository};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::graph::{Graph, GraphId, NodeId};
use crate::model::{Execution, ExecutionId, ExecutionStatus, NodeExecution, NodeExecutionId};
use crate::value::{Value, ValueMap};

/// Errors returned by repository implementations
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// No execution row with this id
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// No node execution row with this id
    #[error("node execution not found: {0}")]
    NodeExecutionNotFound(NodeExecutionId),

    /// No graph row with this id
    #[error("graph not found: {0}")]
    GraphNotFound(GraphId),

    /// A node id was not part of the execution's graph
    #[error("node not found in graph: {0}")]
    NodeNotFound(NodeId),

    /// The status machine forbids this transition
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Persisted status
        from: ExecutionStatus,
        /// Rejected target status
        to: ExecutionStatus,
    },

    /// The backing store failed
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// An execution loaded for dispatch, with its graph eagerly expanded.
#[derive(Debug, Clone)]
pub struct ExecutionForRun {
    /// The execution row
    pub execution: Execution,
    /// The graph, nodes and edges included
    pub graph: Graph,
}

/// Abstract persistent store for graphs, executions, and node executions.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist a graph with its nodes and edges.
    async fn create_graph(&self, graph: Graph) -> Result<(), RepositoryError>;

    /// Persist a fresh PENDING execution.
    async fn create_execution(&self, execution: Execution) -> Result<(), RepositoryError>;

    /// Load an execution with its graph eagerly expanded.
    async fn load_execution_for_run(
        &self,
        id: ExecutionId,
    ) -> Result<ExecutionForRun, RepositoryError>;

    /// Compare-and-swap the execution status.
    ///
    /// `started_at` is written when the transition enters RUNNING;
    /// `completed_at` and `error_message` when it enters a terminal state.
    async fn set_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> Result<(), RepositoryError>;

    /// Bulk-insert one PENDING node execution per node id, returning the
    /// `node_key -> id` map the scheduler drives with.
    async fn create_node_executions(
        &self,
        execution_id: ExecutionId,
        node_ids: &[NodeId],
    ) -> Result<HashMap<String, NodeExecutionId>, RepositoryError>;

    /// Transition a node execution PENDING -> RUNNING, recording the
    /// worker handle and input bundle.
    async fn start_node_execution(
        &self,
        id: NodeExecutionId,
        runner_task_id: &str,
        input_data: ValueMap,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Transition a node execution RUNNING -> {SUCCESS, FAILED, TIMEOUT},
    /// or PENDING -> CANCELLED for gated-out and cancelled nodes.
    async fn complete_node_execution(
        &self,
        id: NodeExecutionId,
        status: ExecutionStatus,
        output_data: Option<Value>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// All node executions of this execution that have reached a terminal
    /// status. Used for gating reads and fan-in aggregation.
    async fn list_terminal_node_executions(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<NodeExecution>, RepositoryError>;

    /// Terminal statuses keyed by node id, for fan-in aggregation.
    async fn terminal_statuses_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<HashMap<NodeId, ExecutionStatus>, RepositoryError>;
}
