//! Durable execution records
//!
//! [`Execution`] and [`NodeExecution`] are the rows the engine persists
//! through the repository. Both follow the same monotonic
//! [`ExecutionStatus`] machine: once a terminal status is written it never
//! changes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::id_newtype;
use crate::graph::{GraphId, NodeId};
use crate::value::{Value, ValueMap};

id_newtype!(
    /// Opaque identifier of an [`Execution`].
    ExecutionId
);
id_newtype!(
    /// Opaque identifier of a [`NodeExecution`].
    NodeExecutionId
);

/// Status of an execution or node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, not yet dispatched
    Pending,
    /// Dispatched and in flight
    Running,
    /// Terminal: completed successfully
    Success,
    /// Terminal: failed
    Failed,
    /// Terminal: cancelled before running (or the whole execution was cancelled)
    Cancelled,
    /// Terminal: deadline exceeded
    Timeout,
}

impl ExecutionStatus {
    /// True for any of SUCCESS, FAILED, CANCELLED, TIMEOUT.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Whether the status machine permits moving from `self` to `next`.
    ///
    /// Terminal states admit no transition; PENDING may run, fail at
    /// dispatch, or be cancelled without running; RUNNING ends in any
    /// terminal state.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Success | Failed | Cancelled | Timeout),
            Success | Failed | Cancelled | Timeout => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One requested run of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution id
    pub id: ExecutionId,
    /// Graph this execution runs
    pub graph_id: GraphId,
    /// Current status
    pub status: ExecutionStatus,
    /// Immutable context handed verbatim to every node run
    pub context: ValueMap,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set exactly when RUNNING is first written
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly when a terminal status is written
    pub completed_at: Option<DateTime<Utc>>,
    /// Non-empty iff status is FAILED, CANCELLED, or TIMEOUT
    pub error_message: Option<String>,
}

impl Execution {
    /// Create a fresh PENDING execution for a graph.
    pub fn new(graph_id: GraphId, context: ValueMap) -> Self {
        Self {
            id: ExecutionId::new(),
            graph_id,
            status: ExecutionStatus::Pending,
            context,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// One node's run inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Node execution id
    pub id: NodeExecutionId,
    /// Owning execution
    pub execution_id: ExecutionId,
    /// Node being run
    pub node_id: NodeId,
    /// Current status
    pub status: ExecutionStatus,
    /// Input bundle assembled from successful predecessors
    pub input_data: Option<ValueMap>,
    /// Runner output, non-null only on SUCCESS
    pub output_data: Option<Value>,
    /// Failure or gate reason
    pub error_message: Option<String>,
    /// Set on RUNNING
    pub started_at: Option<DateTime<Utc>>,
    /// Set on any terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque observability handle for the worker task
    pub runner_task_id: Option<String>,
}

impl NodeExecution {
    /// Create a fresh PENDING node execution.
    pub fn new(execution_id: ExecutionId, node_id: NodeId) -> Self {
        Self {
            id: NodeExecutionId::new(),
            execution_id,
            node_id,
            status: ExecutionStatus::Pending,
            input_data: None,
            output_data: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            runner_task_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_transition_relation() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Success));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Timeout));
        // Terminal states are final.
        for terminal in [Success, Failed, Cancelled, Timeout] {
            for next in [Pending, Running, Success, Failed, Cancelled, Timeout] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("BOGUS".parse::<ExecutionStatus>().is_err());
    }
}
