//! Per-execution scheduling
//!
//! One [`Scheduler`] owns one execution from dispatch to its terminal
//! status. It walks the level partition in order; within a level it gates
//! each node on its predecessors' terminal statuses, fans the runnable
//! ones out to the node runner under a bounded worker pool, and waits for
//! the whole level to reach terminal node statuses before moving on. All
//! terminal writes of level `i` therefore happen before any dispatch of
//! level `i + 1`.
//!
//! Cancellation is cooperative: the status flag in the state store is
//! checked at every level boundary and again before each worker invokes
//! the runner. In-flight runs are never interrupted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::graph::{EdgeCondition, GraphAnalyzer};
use crate::model::{ExecutionId, ExecutionStatus, NodeExecution, NodeExecutionId};
use crate::repository::{ExecutionForRun, Repository, RepositoryError};
use crate::runner::{NodeRunner, RunOutcome, RunRequest};
use crate::state_store::StateStore;
use crate::value::{Value, ValueMap};

use super::plan::ExecutionPlan;
use super::EngineConfig;

const REPOSITORY_UNAVAILABLE: &str = "repository unavailable";

/// Unrecoverable conditions that end the execution as FAILED.
enum Abort {
    /// A repository write failed twice
    Repository,
    /// A worker task died outside the runner boundary
    Worker(String),
}

impl Abort {
    fn message(&self) -> String {
        match self {
            Abort::Repository => REPOSITORY_UNAVAILABLE.to_string(),
            Abort::Worker(detail) => format!("internal scheduler error: {detail}"),
        }
    }
}

/// Whether a gated node may run, and with which input bundle.
enum GateDecision {
    Run(ValueMap),
    Skip(String),
}

/// Drives a single execution to a terminal state.
pub(crate) struct Scheduler {
    repository: Arc<dyn Repository>,
    state_store: Arc<dyn StateStore>,
    runner: Arc<dyn NodeRunner>,
    config: EngineConfig,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            state_store: Arc::clone(&self.state_store),
            runner: Arc::clone(&self.runner),
            config: self.config.clone(),
        }
    }
}

impl Scheduler {
    pub(crate) fn new(
        repository: Arc<dyn Repository>,
        state_store: Arc<dyn StateStore>,
        runner: Arc<dyn NodeRunner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            state_store,
            runner,
            config,
        }
    }

    /// Run the execution to completion. Never panics; every failure path
    /// ends in a terminal execution status or a logged loss.
    #[instrument(skip_all, fields(execution_id = %loaded.execution.id))]
    pub(crate) async fn run(&self, loaded: ExecutionForRun) {
        let execution_id = loaded.execution.id;
        let graph = loaded.graph;

        let analyzer = GraphAnalyzer::new(&graph.nodes, &graph.edges);
        let levels = match analyzer.validate().and_then(|_| analyzer.levels()) {
            Ok(levels) => levels,
            Err(reason) => {
                info!(%reason, "graph rejected at dispatch");
                self.fail_before_start(execution_id, format!("graph validation failed: {reason}"))
                    .await;
                return;
            }
        };

        // RUNNING is written first: the CAS doubles as the idempotency
        // guard against duplicate dispatch of the same execution.
        match self
            .retry("mark execution running", || {
                self.repository.set_execution_status(
                    execution_id,
                    ExecutionStatus::Running,
                    Some(Utc::now()),
                    None,
                    None,
                )
            })
            .await
        {
            Ok(()) => {}
            Err(RepositoryError::InvalidTransition { from, .. }) => {
                info!(%from, "duplicate dispatch suppressed, persisted state is authoritative");
                return;
            }
            Err(err) => {
                error!(%err, "could not mark execution running");
                self.fail_before_start(execution_id, REPOSITORY_UNAVAILABLE.to_string())
                    .await;
                return;
            }
        }

        let node_ids: Vec<_> = graph.nodes.iter().map(|n| n.id).collect();
        let node_exec_ids = match self
            .retry("create node executions", || {
                self.repository
                    .create_node_executions(execution_id, &node_ids)
            })
            .await
        {
            Ok(map) => map,
            Err(err) => {
                error!(%err, "could not create node executions");
                self.write_terminal(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(REPOSITORY_UNAVAILABLE.to_string()),
                )
                .await;
                return;
            }
        };

        if let Err(err) = self
            .state_store
            .init(
                execution_id,
                ExecutionStatus::Running,
                self.config.state_store_ttl,
            )
            .await
        {
            // Cancellation signalling degrades but durable truth is intact.
            warn!(%err, "state store unavailable at init");
        }

        let plan = Arc::new(ExecutionPlan::new(
            execution_id,
            loaded.execution.context,
            &graph,
            analyzer,
            levels,
            node_exec_ids,
        ));

        let workers = Arc::new(Semaphore::new(self.config.per_execution_workers));
        let mut cancelled = false;
        for (index, level) in plan.levels.iter().enumerate() {
            if self.cancel_requested(execution_id).await {
                info!(level = index, "cancellation observed at level boundary");
                cancelled = true;
                break;
            }
            debug!(level = index, size = level.len(), "dispatching level");
            if let Err(abort) = self.dispatch_level(&plan, level, &workers).await {
                error!(message = %abort.message(), "level dispatch aborted");
                self.write_terminal(execution_id, ExecutionStatus::Failed, Some(abort.message()))
                    .await;
                self.clear_state(execution_id).await;
                return;
            }
        }

        if cancelled {
            self.cancel_pending_nodes(&plan).await;
        }
        self.finalize(&plan, cancelled).await;
    }

    /// Gate every node of the level, fan the runnable ones out, and wait
    /// for the whole level to reach terminal node statuses.
    async fn dispatch_level(
        &self,
        plan: &Arc<ExecutionPlan>,
        level: &[String],
        workers: &Arc<Semaphore>,
    ) -> Result<(), Abort> {
        let terminal = self
            .retry("read terminal node executions", || {
                self.repository
                    .list_terminal_node_executions(plan.execution_id)
            })
            .await
            .map_err(|err| {
                error!(%err, "gating read failed");
                Abort::Repository
            })?;
        let terminal_by_key: HashMap<&str, &NodeExecution> = terminal
            .iter()
            .filter_map(|row| plan.node_key_of(row.node_id).map(|key| (key, row)))
            .collect();

        let mut join_set: JoinSet<Result<(), Abort>> = JoinSet::new();
        for node_key in level {
            match evaluate_gate(plan, node_key, &terminal_by_key) {
                GateDecision::Skip(reason) => {
                    debug!(node_key = %node_key, %reason, "node skipped by gate");
                    self.complete_node(
                        plan.node_exec_id(node_key),
                        ExecutionStatus::Cancelled,
                        None,
                        Some(reason),
                    )
                    .await?;
                }
                GateDecision::Run(inputs) => {
                    let scheduler = self.clone();
                    let plan = Arc::clone(plan);
                    let workers = Arc::clone(workers);
                    let node_key = node_key.clone();
                    join_set
                        .spawn(async move { scheduler.run_node(plan, workers, node_key, inputs).await });
                }
            }
        }

        // Fan-in barrier: every worker of this level must be terminal
        // before the caller may look at the next level.
        let mut abort = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(worker_abort)) => abort = Some(worker_abort),
                Err(join_error) => abort = Some(Abort::Worker(join_error.to_string())),
            }
        }
        match abort {
            Some(abort) => Err(abort),
            None => Ok(()),
        }
    }

    /// Run one node: cancellation check, RUNNING write, runner invocation
    /// under the deadline, terminal write, state store bookkeeping.
    async fn run_node(
        self,
        plan: Arc<ExecutionPlan>,
        workers: Arc<Semaphore>,
        node_key: String,
        inputs: ValueMap,
    ) -> Result<(), Abort> {
        let _permit = workers
            .acquire_owned()
            .await
            .map_err(|err| Abort::Worker(format!("worker pool closed: {err}")))?;

        let node_exec_id = plan.node_exec_id(&node_key);

        // Cancellation checkpoint before dispatch: the node has not
        // started, so it is cancelled rather than run.
        if self.cancel_requested(plan.execution_id).await {
            debug!(node_key = %node_key, "cancellation observed before dispatch");
            return self
                .complete_node(
                    node_exec_id,
                    ExecutionStatus::Cancelled,
                    None,
                    Some("execution cancelled".to_string()),
                )
                .await;
        }

        let node = plan.node(&node_key);
        let runner_task_id = format!("run-{}", Uuid::new_v4());
        match self
            .retry("start node execution", || {
                self.repository.start_node_execution(
                    node_exec_id,
                    &runner_task_id,
                    inputs.clone(),
                    Utc::now(),
                )
            })
            .await
        {
            Ok(()) => {}
            Err(RepositoryError::InvalidTransition { from, .. }) => {
                warn!(node_key = %node_key, %from, "node already dispatched, skipping");
                return Ok(());
            }
            Err(err) => {
                error!(node_key = %node_key, %err, "could not start node execution");
                return Err(Abort::Repository);
            }
        }

        let timeout = if node.timeout_seconds > 0 {
            Duration::from_secs(node.timeout_seconds)
        } else {
            self.config.default_node_timeout
        };
        let deadline = Instant::now() + timeout;
        let request = RunRequest {
            payload: node.payload.clone(),
            constants: node.constants.clone(),
            inputs,
            context: plan.context.clone(),
            deadline,
        };

        // The runner owns the deadline by contract; the spawn plus
        // timeout_at enforce it from this side and convert a panicking
        // runner into a recorded failure. A run that overshoots keeps
        // going detached; only its result is dropped.
        let runner = Arc::clone(&self.runner);
        let handle = tokio::spawn(async move { runner.run(request).await });
        let outcome = match tokio::time::timeout_at(deadline, handle).await {
            Err(_) => RunOutcome::Timeout {
                error: format!("node run exceeded {}s deadline", timeout.as_secs()),
            },
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => RunOutcome::Failure {
                error: format!("runner panicked: {join_error}"),
            },
        };

        let (status, output, error) = match outcome {
            RunOutcome::Success(output) => (ExecutionStatus::Success, Some(output), None),
            RunOutcome::Failure { error } => (ExecutionStatus::Failed, None, Some(error)),
            RunOutcome::Timeout { error } => (ExecutionStatus::Timeout, None, Some(error)),
        };
        debug!(node_key = %node_key, %status, "node finished");
        self.complete_node(node_exec_id, status, output, error)
            .await?;

        // Post-mortem bookkeeping only; gating reads the repository.
        let touched = if status == ExecutionStatus::Success {
            self.state_store
                .add_completed(plan.execution_id, &node_key)
                .await
        } else {
            self.state_store.add_failed(plan.execution_id, &node_key).await
        };
        if let Err(err) = touched {
            warn!(node_key = %node_key, %err, "state store write dropped");
        }
        Ok(())
    }

    /// Terminal write for a node execution, tolerating the CAS guard.
    async fn complete_node(
        &self,
        id: NodeExecutionId,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<(), Abort> {
        match self
            .retry("complete node execution", || {
                self.repository.complete_node_execution(
                    id,
                    status,
                    output.clone(),
                    error.clone(),
                    Utc::now(),
                )
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(RepositoryError::InvalidTransition { from, .. }) => {
                warn!(%from, to = %status, "node already terminal, keeping persisted state");
                Ok(())
            }
            Err(err) => {
                error!(%err, "could not complete node execution");
                Err(Abort::Repository)
            }
        }
    }

    /// On an observed cancel, move every still-PENDING node to CANCELLED.
    async fn cancel_pending_nodes(&self, plan: &ExecutionPlan) {
        let terminal_keys: Vec<String> = match self
            .repository
            .list_terminal_node_executions(plan.execution_id)
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| plan.node_key_of(row.node_id).map(str::to_string))
                .collect(),
            Err(err) => {
                warn!(%err, "could not read terminal nodes before cancel sweep");
                Vec::new()
            }
        };
        for node_key in plan.node_keys() {
            if terminal_keys.iter().any(|k| k == node_key) {
                continue;
            }
            let result = self
                .complete_node(
                    plan.node_exec_id(node_key),
                    ExecutionStatus::Cancelled,
                    None,
                    Some("execution cancelled".to_string()),
                )
                .await;
            if result.is_err() {
                warn!(node_key = %node_key, "could not cancel pending node");
            }
        }
    }

    /// Fan-in of the whole execution: aggregate node statuses into the
    /// execution's terminal status and clear the ephemeral state.
    async fn finalize(&self, plan: &ExecutionPlan, cancelled: bool) {
        let execution_id = plan.execution_id;
        let statuses = match self
            .retry("read terminal statuses", || {
                self.repository.terminal_statuses_by_execution(execution_id)
            })
            .await
        {
            Ok(statuses) => statuses,
            Err(err) => {
                error!(%err, "aggregation read failed");
                self.write_terminal(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(REPOSITORY_UNAVAILABLE.to_string()),
                )
                .await;
                self.clear_state(execution_id).await;
                return;
            }
        };
        let status_by_key: HashMap<&str, ExecutionStatus> = statuses
            .iter()
            .filter_map(|(node_id, status)| plan.node_key_of(*node_id).map(|key| (key, *status)))
            .collect();

        let cancel_observed = cancelled || self.cancel_requested(execution_id).await;
        let failed_names: Vec<&str> = plan
            .node_keys()
            .iter()
            .filter(|key| {
                matches!(
                    status_by_key.get(key.as_str()),
                    Some(ExecutionStatus::Failed) | Some(ExecutionStatus::Timeout)
                )
            })
            .map(|key| plan.node(key).name.as_str())
            .collect();
        let succeeded = status_by_key
            .values()
            .any(|status| *status == ExecutionStatus::Success);

        // A genuine failure outranks the cancel catch-all: a node that
        // FAILED before the cancel was observed must not be masked.
        let (status, error) = if !failed_names.is_empty() {
            (
                ExecutionStatus::Failed,
                Some(format!("failed nodes: {}", failed_names.join(", "))),
            )
        } else if cancel_observed {
            (
                ExecutionStatus::Cancelled,
                Some("execution cancelled".to_string()),
            )
        } else if succeeded {
            (ExecutionStatus::Success, None)
        } else {
            (
                ExecutionStatus::Failed,
                Some("no nodes completed successfully".to_string()),
            )
        };

        self.write_terminal(execution_id, status, error).await;
        self.clear_state(execution_id).await;
        info!(%status, "execution finished");
    }

    /// Terminal execution write, tolerating the CAS guard.
    async fn write_terminal(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) {
        let result = self
            .retry("write terminal execution status", || {
                self.repository.set_execution_status(
                    execution_id,
                    status,
                    None,
                    Some(Utc::now()),
                    error.clone(),
                )
            })
            .await;
        match result {
            Ok(()) => {}
            Err(RepositoryError::InvalidTransition { from, .. }) => {
                warn!(%from, to = %status, "execution already terminal, keeping persisted state");
            }
            Err(err) => {
                error!(%err, "terminal execution status lost");
            }
        }
    }

    /// Validation or init failed before RUNNING: the execution goes
    /// FAILED straight from PENDING.
    async fn fail_before_start(&self, execution_id: ExecutionId, reason: String) {
        self.write_terminal(execution_id, ExecutionStatus::Failed, Some(reason))
            .await;
    }

    async fn clear_state(&self, execution_id: ExecutionId) {
        if let Err(err) = self.state_store.clear(execution_id).await {
            warn!(%err, "state store clear dropped");
        }
    }

    async fn cancel_requested(&self, execution_id: ExecutionId) -> bool {
        match self.state_store.status_flag(execution_id).await {
            Ok(flag) => flag == Some(ExecutionStatus::Cancelled),
            Err(err) => {
                warn!(%err, "state store flag read failed");
                false
            }
        }
    }

    /// Retry an idempotent repository call once with a jittered pause.
    /// The CAS guard is not an outage and is surfaced immediately.
    async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, RepositoryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(err @ RepositoryError::InvalidTransition { .. }) => Err(err),
            Err(err) => {
                warn!(%err, what, "repository call failed, retrying once");
                let jitter = Duration::from_millis(100 + rand::random::<u64>() % 100);
                tokio::time::sleep(jitter).await;
                op().await
            }
        }
    }
}

/// Decide whether a node may run given its predecessors' terminal
/// statuses, assembling the input bundle as a side product.
///
/// TIMEOUT is deliberately distinct from FAILED here: an ON_FAILURE edge
/// out of a timed-out predecessor does not fire.
fn evaluate_gate(
    plan: &ExecutionPlan,
    node_key: &str,
    terminal_by_key: &HashMap<&str, &NodeExecution>,
) -> GateDecision {
    let mut inputs = ValueMap::new();
    for (pred_key, condition) in plan.analyzer.predecessors(node_key) {
        let Some(row) = terminal_by_key.get(pred_key.as_str()) else {
            // The level barrier makes this unreachable for well-formed
            // plans; refuse to run rather than race a live predecessor.
            return GateDecision::Skip(format!(
                "gate: predecessor `{pred_key}` has no terminal status"
            ));
        };
        let satisfied = match condition {
            EdgeCondition::OnSuccess => row.status == ExecutionStatus::Success,
            EdgeCondition::OnFailure => row.status == ExecutionStatus::Failed,
            EdgeCondition::Always => true,
        };
        if !satisfied {
            return GateDecision::Skip(format!(
                "gate: predecessor `{pred_key}` ended {}, edge requires {condition}",
                row.status
            ));
        }
        // Only successful predecessors contribute to the bundle; a failed
        // ALWAYS/ON_FAILURE predecessor is signalled by its absence.
        if row.status == ExecutionStatus::Success {
            if let Some(output) = &row.output_data {
                inputs.insert(pred_key.clone(), output.clone());
            }
        }
    }
    GateDecision::Run(inputs)
}
