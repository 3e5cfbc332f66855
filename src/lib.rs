//! # dagflow
//!
//! An execution engine for user-defined DAG workflows.
//!
//! ## Overview
//!
//! Users define a graph whose nodes carry opaque units of computation and
//! whose directed edges encode precedence plus a condition (fire on
//! predecessor success, on failure, or always). dagflow accepts an
//! execution request against a stored graph, schedules nodes across a
//! bounded worker pool honouring precedence and conditions, aggregates
//! predecessor outputs into downstream input bundles, persists the full
//! trace, and exposes live progress to observers.
//!
//! ## Key pieces
//!
//! - **Graph analysis**: cycle detection, topological ordering, and
//!   longest-path level partitioning over the declared edges
//! - **Scheduling**: level-by-level fan-out/fan-in with conditional edge
//!   gating, per-node timeouts, and cooperative cancellation
//! - **Persistence**: an abstract repository for the durable trace and a
//!   fast state store for live signalling, with in-memory, PostgreSQL,
//!   and Redis implementations
//! - **Runners**: an opaque async interface for the code that actually
//!   executes a node's payload

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for dagflow operations
pub type Result<T> = std::result::Result<T, DagflowError>;

/// Umbrella error for dagflow operations
#[derive(Error, Debug)]
pub enum DagflowError {
    /// Graph structure error (cycles, unknown keys, etc.)
    #[error("graph error: {0}")]
    Graph(#[from] graph::GraphError),

    /// Engine front-door error
    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Repository error
    #[error("repository error: {0}")]
    Repository(#[from] repository::RepositoryError),

    /// State store error
    #[error("state store error: {0}")]
    StateStore(#[from] state_store::StateStoreError),
}

/// Graph definitions and static analysis
pub mod graph;

/// Durable execution records and the status machine
pub mod model;

/// Opaque values passed between nodes
pub mod value;

/// Abstract persistent storage and its implementations
pub mod repository;

/// Ephemeral live-execution state and its implementations
pub mod state_store;

/// The node runner boundary
pub mod runner;

/// The execution engine: scheduler and front door
pub mod engine;

pub use engine::{EngineConfig, EngineError, WorkflowEngine};
pub use graph::{Edge, EdgeCondition, Graph, GraphAnalyzer, GraphId, Node, NodeId};
pub use model::{Execution, ExecutionId, ExecutionStatus, NodeExecution, NodeExecutionId};
pub use runner::{FnRunner, NodeRunner, RunOutcome, RunRequest};
pub use value::{Value, ValueMap};
