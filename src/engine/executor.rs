//! The engine front door
//!
//! [`WorkflowEngine`] is the only surface callers use: submit a persisted
//! PENDING execution, cancel an in-flight one, retry a finished one as a
//! fresh execution, and read live progress. Submission is non-blocking;
//! each accepted execution pins one scheduler on the runtime and the
//! engine-wide cap bounds how many run at once.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::model::{Execution, ExecutionId, ExecutionStatus};
use crate::repository::{Repository, RepositoryError};
use crate::runner::NodeRunner;
use crate::state_store::{ExecutionProgress, StateStore};

use super::scheduler::Scheduler;
use super::{EngineConfig, EngineError};

/// Front door for submitting, cancelling, and observing executions.
pub struct WorkflowEngine {
    repository: Arc<dyn Repository>,
    state_store: Arc<dyn StateStore>,
    runner: Arc<dyn NodeRunner>,
    config: EngineConfig,
    execution_permits: Arc<Semaphore>,
}

impl WorkflowEngine {
    /// Assemble an engine over its collaborators.
    pub fn new(
        repository: Arc<dyn Repository>,
        state_store: Arc<dyn StateStore>,
        runner: Arc<dyn NodeRunner>,
        config: EngineConfig,
    ) -> Self {
        let execution_permits = Arc::new(Semaphore::new(config.max_concurrent_executions));
        Self {
            repository,
            state_store,
            runner,
            config,
            execution_permits,
        }
    }

    /// Dispatch a persisted PENDING execution onto the engine.
    ///
    /// Non-blocking: the scheduler runs on the runtime and this returns as
    /// soon as the execution is accepted. Submitting an execution that is
    /// no longer PENDING is a no-op, so resubmission is safe.
    #[instrument(skip(self))]
    pub async fn submit_execution(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let loaded = self
            .repository
            .load_execution_for_run(execution_id)
            .await
            .map_err(not_found(execution_id))?;

        if loaded.execution.status != ExecutionStatus::Pending {
            info!(status = %loaded.execution.status, "execution already dispatched, nothing to do");
            return Ok(());
        }
        if !loaded.graph.is_active {
            return Err(EngineError::GraphInactive(loaded.graph.id));
        }

        let permit = self
            .execution_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;

        let scheduler = Scheduler::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.state_store),
            Arc::clone(&self.runner),
            self.config.clone(),
        );
        tokio::spawn(async move {
            let _permit = permit;
            scheduler.run(loaded).await;
        });
        Ok(())
    }

    /// Request cancellation of an in-flight execution.
    ///
    /// Returns immediately after flipping the live status flag; the owning
    /// scheduler observes it at its next checkpoint, so in-flight node
    /// runs complete while nothing further is dispatched. Repeat cancels
    /// are no-ops.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let loaded = self
            .repository
            .load_execution_for_run(execution_id)
            .await
            .map_err(not_found(execution_id))?;

        match loaded.execution.status {
            ExecutionStatus::Cancelled => Ok(()),
            status if status.is_terminal() => Err(EngineError::AlreadyTerminal {
                id: execution_id,
                status,
            }),
            _ => {
                self.state_store
                    .set_status_flag(execution_id, ExecutionStatus::Cancelled)
                    .await?;
                info!("cancellation requested");
                Ok(())
            }
        }
    }

    /// Create and submit a fresh execution for the same graph and context
    /// as an existing one, returning the new execution's id.
    ///
    /// This is not a node retry: the original execution and its node
    /// results are untouched.
    #[instrument(skip(self))]
    pub async fn retry_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionId, EngineError> {
        let loaded = self
            .repository
            .load_execution_for_run(execution_id)
            .await
            .map_err(not_found(execution_id))?;
        if !loaded.graph.is_active {
            return Err(EngineError::GraphInactive(loaded.graph.id));
        }

        let execution = Execution::new(loaded.execution.graph_id, loaded.execution.context);
        let new_id = execution.id;
        self.repository.create_execution(execution).await?;
        if let Err(err) = self.submit_execution(new_id).await {
            warn!(%err, "retry created execution but submission failed");
            return Err(err);
        }
        Ok(new_id)
    }

    /// Live progress of an execution from the state store: the status
    /// flag and the node keys completed and failed so far. `None` once
    /// the entry is cleared or expired.
    pub async fn execution_progress(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionProgress>, EngineError> {
        Ok(self.state_store.snapshot(execution_id).await?)
    }
}

fn not_found(execution_id: ExecutionId) -> impl Fn(RepositoryError) -> EngineError {
    move |err| match err {
        RepositoryError::ExecutionNotFound(_) => EngineError::NotFound(execution_id),
        other => EngineError::Repository(other),
    }
}
