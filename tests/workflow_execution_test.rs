//! End-to-end scheduling scenarios over the in-memory adapters.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use dagflow::engine::EngineError;
use dagflow::repository::{MemoryRepository, Repository};
use dagflow::state_store::MemoryStateStore;
use dagflow::{
    EdgeCondition, EngineConfig, Execution, ExecutionId, ExecutionStatus, FnRunner, Graph, Node,
    NodeExecution, RunOutcome, RunRequest, Value, ValueMap, WorkflowEngine,
};

/// Runner driven by the node payload: `sleep_ms` delays, `fail` fails,
/// `append` concatenates predecessor outputs with a suffix, `result`
/// returns a fixed value.
fn scripted_runner() -> FnRunner {
    FnRunner::new(|request: RunRequest| async move {
        let payload = request.payload.as_mapping().cloned().unwrap_or_default();
        if let Some(Value::Integer(ms)) = payload.get("sleep_ms") {
            tokio::time::sleep(Duration::from_millis(*ms as u64)).await;
        }
        if let Some(Value::String(message)) = payload.get("fail") {
            return RunOutcome::Failure {
                error: message.clone(),
            };
        }
        if let Some(Value::String(suffix)) = payload.get("append") {
            let mut joined = String::new();
            for value in request.inputs.values() {
                if let Some(s) = value.as_str() {
                    joined.push_str(s);
                }
            }
            joined.push_str(suffix);
            return RunOutcome::Success(Value::String(joined));
        }
        RunOutcome::Success(payload.get("result").cloned().unwrap_or(Value::Null))
    })
}

fn payload(entries: &[(&str, Value)]) -> Value {
    Value::Mapping(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

struct Harness {
    repository: Arc<MemoryRepository>,
    engine: WorkflowEngine,
}

impl Harness {
    fn new() -> Self {
        Self::with_runner(Arc::new(scripted_runner()))
    }

    fn with_runner(runner: Arc<dyn dagflow::NodeRunner>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let repository = Arc::new(MemoryRepository::new());
        let state_store = Arc::new(MemoryStateStore::new());
        let config = EngineConfig::default().with_per_execution_workers(4);
        let engine = WorkflowEngine::new(
            repository.clone() as Arc<dyn Repository>,
            state_store,
            runner,
            config,
        );
        Self { repository, engine }
    }

    async fn seed(&self, graph: &Graph) -> ExecutionId {
        self.seed_with_context(graph, ValueMap::new()).await
    }

    async fn seed_with_context(&self, graph: &Graph, context: ValueMap) -> ExecutionId {
        self.repository.create_graph(graph.clone()).await.unwrap();
        let execution = Execution::new(graph.id, context);
        let id = execution.id;
        self.repository.create_execution(execution).await.unwrap();
        id
    }

    async fn run_to_terminal(&self, execution_id: ExecutionId) -> Execution {
        self.engine.submit_execution(execution_id).await.unwrap();
        self.await_terminal(execution_id).await
    }

    async fn await_terminal(&self, execution_id: ExecutionId) -> Execution {
        for _ in 0..500 {
            let execution = self.repository.execution(execution_id).unwrap();
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {execution_id} did not reach a terminal status");
    }

    async fn node_exec(&self, graph: &Graph, execution_id: ExecutionId, key: &str) -> NodeExecution {
        let node_id = graph.node(key).unwrap().id;
        self.repository
            .list_terminal_node_executions(execution_id)
            .await
            .unwrap()
            .into_iter()
            .find(|row| row.node_id == node_id)
            .unwrap_or_else(|| panic!("no terminal node execution for `{key}`"))
    }
}

#[tokio::test]
async fn test_linear_chain_succeeds() {
    let harness = Harness::new();
    let graph = Graph::new("chain");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", payload(&[("append", Value::from("a"))])))
        .with_node(Node::new(gid, "B", payload(&[("append", Value::from("b"))])))
        .with_node(Node::new(gid, "C", payload(&[("append", Value::from("c"))])))
        .with_edge("A", "B", EdgeCondition::OnSuccess)
        .with_edge("B", "C", EdgeCondition::OnSuccess);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.error_message, None);
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());

    let a = harness.node_exec(&graph, execution_id, "A").await;
    let b = harness.node_exec(&graph, execution_id, "B").await;
    let c = harness.node_exec(&graph, execution_id, "C").await;
    assert_eq!(c.output_data, Some(Value::from("abc")));
    assert_eq!(
        b.input_data,
        Some(ValueMap::from([("A".to_string(), Value::from("a"))]))
    );
    // Topology: a successor starts only after its predecessor completed.
    assert!(b.started_at.unwrap() > a.completed_at.unwrap());
    assert!(c.started_at.unwrap() > b.completed_at.unwrap());
}

#[tokio::test]
async fn test_diamond_with_failing_branch() {
    let harness = Harness::new();
    let graph = Graph::new("diamond");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", payload(&[("result", Value::from("a"))])))
        .with_node(Node::new(gid, "B", payload(&[("fail", Value::from("branch B broke"))])))
        .with_node(Node::new(gid, "C", payload(&[("result", Value::from("c"))])))
        .with_node(Node::new(gid, "D", payload(&[("result", Value::from("d"))])))
        .with_edge("A", "B", EdgeCondition::OnSuccess)
        .with_edge("A", "C", EdgeCondition::OnSuccess)
        .with_edge("B", "D", EdgeCondition::OnSuccess)
        .with_edge("C", "D", EdgeCondition::OnSuccess);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().contains("B"));

    let statuses = [
        harness.node_exec(&graph, execution_id, "A").await.status,
        harness.node_exec(&graph, execution_id, "B").await.status,
        harness.node_exec(&graph, execution_id, "C").await.status,
        harness.node_exec(&graph, execution_id, "D").await.status,
    ];
    assert_eq!(
        statuses,
        [
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Success,
            ExecutionStatus::Cancelled,
        ]
    );
    let d = harness.node_exec(&graph, execution_id, "D").await;
    assert!(d.error_message.unwrap().contains("gate"));
    // Gated-out nodes never reach the runner.
    assert!(d.started_at.is_none());
}

#[tokio::test]
async fn test_on_failure_fallback_runs_when_source_fails() {
    let harness = Harness::new();
    let graph = Graph::new("fallback");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", payload(&[("fail", Value::from("A down"))])))
        .with_node(Node::new(gid, "B", payload(&[("result", Value::from("b"))])))
        .with_node(Node::new(gid, "C", payload(&[("result", Value::from("c"))])))
        .with_edge("A", "B", EdgeCondition::OnSuccess)
        .with_edge("A", "C", EdgeCondition::OnFailure);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    // C succeeded, but a failed node is terminal for the execution.
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().contains("A"));
    assert_eq!(
        harness.node_exec(&graph, execution_id, "B").await.status,
        ExecutionStatus::Cancelled
    );
    let c = harness.node_exec(&graph, execution_id, "C").await;
    assert_eq!(c.status, ExecutionStatus::Success);
    // The failed predecessor contributes nothing to the bundle.
    assert_eq!(c.input_data, Some(ValueMap::new()));
}

#[tokio::test]
async fn test_always_sink_gets_only_successful_inputs() {
    let harness = Harness::new();
    let graph = Graph::new("always-sink");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", payload(&[("result", Value::from("a-out"))])))
        .with_node(Node::new(gid, "B", payload(&[("fail", Value::from("B down"))])))
        .with_node(Node::new(gid, "Z", payload(&[("result", Value::from("z"))])))
        .with_edge("A", "Z", EdgeCondition::Always)
        .with_edge("B", "Z", EdgeCondition::Always);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let z = harness.node_exec(&graph, execution_id, "Z").await;
    assert_eq!(z.status, ExecutionStatus::Success);
    assert_eq!(
        z.input_data,
        Some(ValueMap::from([("A".to_string(), Value::from("a-out"))]))
    );
}

#[tokio::test]
async fn test_node_timeout_propagates_through_gate() {
    let harness = Harness::new();
    let graph = Graph::new("timeout");
    let gid = graph.id;
    let graph = graph
        .with_node(
            Node::new(gid, "X", payload(&[("sleep_ms", Value::Integer(5_000))]))
                .with_timeout_seconds(1),
        )
        .with_node(Node::new(gid, "Y", payload(&[("result", Value::from("y"))])))
        .with_edge("X", "Y", EdgeCondition::OnSuccess);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let x = harness.node_exec(&graph, execution_id, "X").await;
    assert_eq!(x.status, ExecutionStatus::Timeout);
    assert!(x.error_message.unwrap().contains("deadline"));
    assert_eq!(
        harness.node_exec(&graph, execution_id, "Y").await.status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn test_timeout_does_not_satisfy_on_failure_edges() {
    let harness = Harness::new();
    let graph = Graph::new("timeout-strict");
    let gid = graph.id;
    let graph = graph
        .with_node(
            Node::new(gid, "X", payload(&[("sleep_ms", Value::Integer(5_000))]))
                .with_timeout_seconds(1),
        )
        .with_node(Node::new(gid, "F", payload(&[("result", Value::from("f"))])))
        .with_edge("X", "F", EdgeCondition::OnFailure);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    // TIMEOUT is not FAILED for gating: the fallback stays cancelled.
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        harness.node_exec(&graph, execution_id, "F").await.status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn test_unfired_fallback_with_no_failures_is_success() {
    let harness = Harness::new();
    let graph = Graph::new("happy-fallback");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", payload(&[("result", Value::from("a"))])))
        .with_node(Node::new(gid, "C", payload(&[("result", Value::from("c"))])))
        .with_edge("A", "C", EdgeCondition::OnFailure);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    // One success, zero failures: the gate-cancelled fallback does not
    // drag the execution away from SUCCESS.
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(
        harness.node_exec(&graph, execution_id, "C").await.status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn test_context_reaches_every_node() {
    let probe = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = probe.clone();
    let runner = FnRunner::new(move |request: RunRequest| {
        let seen = seen.clone();
        async move {
            seen.lock().push(request.context.clone());
            RunOutcome::Success(Value::Null)
        }
    });
    let harness = Harness::with_runner(Arc::new(runner));

    let graph = Graph::new("ctx");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", Value::Null))
        .with_node(Node::new(gid, "B", Value::Null))
        .with_edge("A", "B", EdgeCondition::Always);

    let context = ValueMap::from([("tenant".to_string(), Value::from("acme"))]);
    let execution_id = harness.seed_with_context(&graph, context.clone()).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Success);
    let observed = probe.lock().clone();
    assert_eq!(observed, vec![context.clone(), context]);
}

#[tokio::test]
async fn test_cyclic_graph_fails_at_dispatch() {
    let harness = Harness::new();
    let graph = Graph::new("cyclic");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", Value::Null))
        .with_node(Node::new(gid, "B", Value::Null))
        .with_edge("A", "B", EdgeCondition::OnSuccess)
        .with_edge("B", "A", EdgeCondition::OnSuccess);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution
        .error_message
        .unwrap()
        .contains("graph validation failed"));
    // Nothing was dispatched.
    assert!(harness
        .repository
        .list_terminal_node_executions(execution_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_resubmission_is_a_no_op() {
    let harness = Harness::new();
    let graph = Graph::new("resubmit");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", payload(&[("result", Value::from("a"))])))
        .with_node(Node::new(gid, "B", payload(&[("result", Value::from("b"))])))
        .with_edge("A", "B", EdgeCondition::OnSuccess);

    let execution_id = harness.seed(&graph).await;
    harness.engine.submit_execution(execution_id).await.unwrap();
    harness.engine.submit_execution(execution_id).await.unwrap();
    let execution = harness.await_terminal(execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Success);

    // Exactly one node execution per node despite the double submit.
    let rows = harness
        .repository
        .list_terminal_node_executions(execution_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    // Submitting a finished execution is also a no-op.
    harness.engine.submit_execution(execution_id).await.unwrap();
    let after = harness.repository.execution(execution_id).unwrap();
    assert_eq!(after.completed_at, execution.completed_at);
}

#[tokio::test]
async fn test_inactive_graph_is_refused() {
    let harness = Harness::new();
    let mut graph = Graph::new("inactive");
    let gid = graph.id;
    graph = graph.with_node(Node::new(gid, "A", Value::Null));
    graph.is_active = false;

    let execution_id = harness.seed(&graph).await;
    let err = harness
        .engine
        .submit_execution(execution_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::GraphInactive(_)));
}

#[tokio::test]
async fn test_unknown_execution_is_not_found() {
    let harness = Harness::new();
    let err = harness
        .engine
        .submit_execution(ExecutionId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_engine_capacity_rejects_with_busy() {
    let repository = Arc::new(MemoryRepository::new());
    let state_store = Arc::new(MemoryStateStore::new());
    let config = EngineConfig::default()
        .with_max_concurrent_executions(1)
        .with_per_execution_workers(4);
    let engine = WorkflowEngine::new(
        repository.clone() as Arc<dyn Repository>,
        state_store,
        Arc::new(scripted_runner()),
        config,
    );

    let graph = Graph::new("busy");
    let gid = graph.id;
    let graph = graph.with_node(Node::new(
        gid,
        "A",
        payload(&[("sleep_ms", Value::Integer(400))]),
    ));
    repository.create_graph(graph.clone()).await.unwrap();

    let first = Execution::new(graph.id, ValueMap::new());
    let second = Execution::new(graph.id, ValueMap::new());
    let (first_id, second_id) = (first.id, second.id);
    repository.create_execution(first).await.unwrap();
    repository.create_execution(second).await.unwrap();

    engine.submit_execution(first_id).await.unwrap();
    let err = engine.submit_execution(second_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy));

    // Capacity frees once the first execution terminates.
    for _ in 0..500 {
        if repository.execution(first_id).unwrap().status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.submit_execution(second_id).await.unwrap();
}

#[tokio::test]
async fn test_panicking_runner_records_node_failure() {
    let runner = FnRunner::new(|request: RunRequest| async move {
        if request.payload.as_str() == Some("panic") {
            panic!("runner blew up");
        }
        RunOutcome::Success(Value::Null)
    });
    let harness = Harness::with_runner(Arc::new(runner));

    let graph = Graph::new("panicky");
    let gid = graph.id;
    let graph = graph
        .with_node(Node::new(gid, "A", Value::from("panic")))
        .with_node(Node::new(gid, "B", Value::Null))
        .with_edge("A", "B", EdgeCondition::Always);

    let execution_id = harness.seed(&graph).await;
    let execution = harness.run_to_terminal(execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let a = harness.node_exec(&graph, execution_id, "A").await;
    assert_eq!(a.status, ExecutionStatus::Failed);
    assert!(a.error_message.unwrap().contains("panic"));
    // The ALWAYS successor still ran.
    assert_eq!(
        harness.node_exec(&graph, execution_id, "B").await.status,
        ExecutionStatus::Success
    );
}
