//! The node runner boundary
//!
//! A [`NodeRunner`] executes a single node's payload. The engine treats it
//! as opaque: it hands over the payload, the node's constants, the input
//! bundle assembled from successful predecessors, and the execution
//! context, and expects a [`RunOutcome`] back before the deadline. Runners
//! must not mutate their inputs visibly to other runs and should report a
//! blown deadline as [`RunOutcome::Timeout`]; the scheduler additionally
//! enforces the deadline on its side.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::value::{Value, ValueMap};

/// Everything a runner receives for one node run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The node's opaque payload descriptor
    pub payload: Value,
    /// The node's static constants
    pub constants: ValueMap,
    /// Outputs of successful predecessors, keyed by node key
    pub inputs: ValueMap,
    /// The execution's immutable context
    pub context: ValueMap,
    /// Absolute deadline for this run
    pub deadline: Instant,
}

/// Result of one node run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run produced an output value
    Success(Value),
    /// The run failed
    Failure {
        /// Human-readable failure reason
        error: String,
    },
    /// The run exceeded its deadline
    Timeout {
        /// Human-readable timeout description
        error: String,
    },
}

/// Executes a single node's payload.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Run one node to completion.
    async fn run(&self, request: RunRequest) -> RunOutcome;
}

type RunFn = dyn Fn(RunRequest) -> BoxFuture<'static, RunOutcome> + Send + Sync;

/// A [`NodeRunner`] backed by an async closure, for embedding and tests.
#[derive(Clone)]
pub struct FnRunner {
    f: Arc<RunFn>,
}

impl FnRunner {
    /// Wrap an async closure as a runner.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(RunRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RunOutcome> + Send + 'static,
    {
        Self {
            f: Arc::new(move |request| Box::pin(f(request))),
        }
    }
}

#[async_trait]
impl NodeRunner for FnRunner {
    async fn run(&self, request: RunRequest) -> RunOutcome {
        (self.f)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fn_runner_passes_request_through() {
        let runner = FnRunner::new(|request: RunRequest| async move {
            match request.payload.as_str() {
                Some("boom") => RunOutcome::Failure {
                    error: "exploded".to_string(),
                },
                _ => RunOutcome::Success(Value::Integer(request.inputs.len() as i64)),
            }
        });

        let base = RunRequest {
            payload: Value::from("ok"),
            constants: ValueMap::new(),
            inputs: ValueMap::from([("a".to_string(), Value::Null)]),
            context: ValueMap::new(),
            deadline: Instant::now() + Duration::from_secs(1),
        };

        assert_eq!(
            runner.run(base.clone()).await,
            RunOutcome::Success(Value::Integer(1))
        );

        let mut failing = base;
        failing.payload = Value::from("boom");
        assert_eq!(
            runner.run(failing).await,
            RunOutcome::Failure {
                error: "exploded".to_string()
            }
        );
    }
}
