//! The execution engine
//!
//! [`WorkflowEngine`] is the front door: submit and cancel executions,
//! retry a finished one, observe live progress. Each submitted execution
//! is owned by one [`scheduler::Scheduler`] from RUNNING to its terminal
//! state; total concurrency is bounded engine-wide.

pub mod executor;
pub mod plan;
pub mod scheduler;

pub use executor::WorkflowEngine;
pub use plan::ExecutionPlan;

use std::time::Duration;

use thiserror::Error;

use crate::graph::GraphId;
use crate::model::{ExecutionId, ExecutionStatus};
use crate::repository::RepositoryError;
use crate::state_store::StateStoreError;

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum executions in flight at once; overflow is rejected
    pub max_concurrent_executions: usize,
    /// Worker pool size per execution
    pub per_execution_workers: usize,
    /// Timeout applied to nodes that do not declare one
    pub default_node_timeout: Duration,
    /// Lifetime of the ephemeral state entry after its last touch
    pub state_store_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 64,
            per_execution_workers: 16,
            default_node_timeout: Duration::from_secs(300),
            state_store_ttl: Duration::from_secs(86_400),
        }
    }
}

impl EngineConfig {
    /// Set the engine-wide execution cap.
    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    /// Set the per-execution worker pool size.
    pub fn with_per_execution_workers(mut self, workers: usize) -> Self {
        self.per_execution_workers = workers;
        self
    }

    /// Set the default node timeout.
    pub fn with_default_node_timeout(mut self, timeout: Duration) -> Self {
        self.default_node_timeout = timeout;
        self
    }

    /// Set the state store TTL.
    pub fn with_state_store_ttl(mut self, ttl: Duration) -> Self {
        self.state_store_ttl = ttl;
        self
    }
}

/// Errors returned by the engine front door
#[derive(Error, Debug)]
pub enum EngineError {
    /// No execution with this id
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),

    /// The graph is deactivated; new executions are refused
    #[error("graph is inactive: {0}")]
    GraphInactive(GraphId),

    /// The engine is at its concurrent-execution cap
    #[error("engine is at capacity")]
    Busy,

    /// The execution already reached a terminal status
    #[error("execution {id} already terminal ({status})")]
    AlreadyTerminal {
        /// The execution
        id: ExecutionId,
        /// Its terminal status
        status: ExecutionStatus,
    },

    /// A repository call failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A state store call failed
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}
