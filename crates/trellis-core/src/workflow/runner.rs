//! Per-node state machine: condition, retries, timeout, fallback.
//!
//! The runner never touches the workflow directly. It takes an owned
//! [`NodeJob`] plus a read-only snapshot of the context, and returns a
//! [`NodeOutcome`] that the engine applies once the whole wave has joined.
//! A node's output therefore becomes visible only after its task is done.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use trellis_types::error::NodeError;
use trellis_types::event::WorkflowEvent;
use trellis_types::workflow::NodeStatus;
use uuid::Uuid;

use crate::event::EventBus;

use super::context::{ContextError, ExecutionContext};
use super::node::{BoxHandler, Condition, Fallback, NodeDefinition};
use super::retry::RetryPolicy;

/// Everything a spawned task needs to run one node.
#[derive(Clone)]
pub struct NodeJob {
    pub id: String,
    pub handler: BoxHandler,
    pub inputs: Map<String, Value>,
    pub condition: Option<Condition>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub fallback: Option<Fallback>,
    /// Handler invocations so far, readable even if the task panics.
    pub attempts: Arc<AtomicU32>,
}

impl NodeJob {
    pub fn from_node(node: &NodeDefinition) -> Self {
        Self {
            id: node.id.clone(),
            handler: node.handler.clone(),
            inputs: node.inputs.clone(),
            condition: node.condition.clone(),
            timeout: node.timeout,
            retry: node.retry,
            fallback: node.fallback.clone(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// Terminal result of one node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResult {
    /// The node's condition was false.
    Skipped,
    /// `recovered_from` holds the last error when the output came from the fallback.
    Succeeded {
        output: Value,
        recovered_from: Option<NodeError>,
    },
    Failed(NodeError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub node_id: String,
    pub result: NodeResult,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl NodeOutcome {
    pub fn status(&self) -> NodeStatus {
        match self.result {
            NodeResult::Skipped => NodeStatus::Skipped,
            NodeResult::Succeeded { .. } => NodeStatus::Success,
            NodeResult::Failed(_) => NodeStatus::Failed,
        }
    }

    /// Move the outcome into the node's state and, on success, into `ctx`.
    ///
    /// Fails only if the node already has an output in this context.
    pub fn apply(
        self,
        node: &mut NodeDefinition,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ContextError> {
        let state = &mut node.state;
        state.status = self.status();
        state.attempts = self.attempts;
        state.started_at = Some(self.started_at);
        state.finished_at = Some(self.finished_at);

        match self.result {
            NodeResult::Skipped => {}
            NodeResult::Succeeded {
                output,
                recovered_from,
            } => {
                state.error = recovered_from;
                state.output = Some(output.clone());
                ctx.set_output(&self.node_id, output)?;
            }
            NodeResult::Failed(error) => state.error = Some(error),
        }
        Ok(())
    }
}

/// Executes single nodes under a run-wide concurrency gate.
#[derive(Clone)]
pub struct NodeRunner {
    run_id: Uuid,
    semaphore: Arc<Semaphore>,
    events: Option<EventBus>,
}

impl NodeRunner {
    pub fn new(run_id: Uuid, semaphore: Arc<Semaphore>, events: Option<EventBus>) -> Self {
        Self {
            run_id,
            semaphore,
            events,
        }
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Run one node to a terminal result.
    ///
    /// Holds one concurrency permit for the whole node, retries included.
    pub async fn run(&self, job: NodeJob, ctx: Arc<ExecutionContext>) -> NodeOutcome {
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let now = Utc::now();
                return self.finish(
                    &job,
                    NodeResult::Failed(NodeError::Execution(
                        "concurrency gate closed".to_string(),
                    )),
                    now,
                );
            }
        };
        let started_at = Utc::now();

        if job
            .condition
            .as_ref()
            .is_some_and(|condition| !condition(ctx.outputs()))
        {
            tracing::info!(node_id = %job.id, "condition false, skipping node");
            return self.finish(&job, NodeResult::Skipped, started_at);
        }

        let inputs = ctx.resolve_inputs(&job.inputs);
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            job.attempts.store(attempt, Ordering::SeqCst);
            self.publish(WorkflowEvent::NodeStarted {
                run_id: self.run_id,
                node_id: job.id.clone(),
                attempt,
            });
            tracing::debug!(node_id = %job.id, attempt, "invoking handler");

            match self.attempt(&job, inputs.clone()).await {
                Ok(output) => {
                    return self.finish(
                        &job,
                        NodeResult::Succeeded {
                            output,
                            recovered_from: None,
                        },
                        started_at,
                    );
                }
                Err(error) if job.retry.should_retry(attempt) => {
                    tracing::warn!(
                        node_id = %job.id,
                        attempt,
                        max_attempts = job.retry.max_attempts(),
                        error = %error,
                        "node attempt failed, retrying"
                    );
                    self.publish(WorkflowEvent::NodeRetrying {
                        run_id: self.run_id,
                        node_id: job.id.clone(),
                        attempt,
                        error: error.to_string(),
                    });
                    tokio::time::sleep(job.retry.retry_delay).await;
                }
                Err(error) => break error,
            }
        };

        let recovered = job
            .fallback
            .as_ref()
            .and_then(|fallback| fallback(&last_error))
            .filter(|value| !value.is_null());

        let result = match recovered {
            Some(output) => {
                tracing::warn!(node_id = %job.id, error = %last_error, "node recovered by fallback");
                NodeResult::Succeeded {
                    output,
                    recovered_from: Some(last_error),
                }
            }
            None => NodeResult::Failed(last_error),
        };
        self.finish(&job, result, started_at)
    }

    async fn attempt(&self, job: &NodeJob, inputs: Map<String, Value>) -> Result<Value, NodeError> {
        let call = job.handler.call(inputs);
        let result = match job.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                NodeError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => call.await,
        };
        result.map_err(|e| NodeError::Execution(format!("{e:#}")))
    }

    fn finish(&self, job: &NodeJob, result: NodeResult, started_at: DateTime<Utc>) -> NodeOutcome {
        let finished_at = Utc::now();
        let attempts = job.attempts.load(Ordering::SeqCst);
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        match &result {
            NodeResult::Skipped => self.publish(WorkflowEvent::NodeSkipped {
                run_id: self.run_id,
                node_id: job.id.clone(),
            }),
            NodeResult::Succeeded { recovered_from, .. } => {
                tracing::info!(node_id = %job.id, attempts, duration_ms, "node succeeded");
                self.publish(WorkflowEvent::NodeSucceeded {
                    run_id: self.run_id,
                    node_id: job.id.clone(),
                    attempts,
                    duration_ms,
                    recovered: recovered_from.is_some(),
                });
            }
            NodeResult::Failed(error) => {
                tracing::error!(node_id = %job.id, attempts, error = %error, "node failed");
                self.publish(WorkflowEvent::NodeFailed {
                    run_id: self.run_id,
                    node_id: job.id.clone(),
                    attempts,
                    error: error.to_string(),
                });
            }
        }

        NodeOutcome {
            node_id: job.id.clone(),
            result,
            attempts,
            started_at,
            finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use anyhow::bail;
    use serde_json::json;

    fn runner(permits: usize) -> NodeRunner {
        NodeRunner::new(Uuid::now_v7(), Arc::new(Semaphore::new(permits)), None)
    }

    fn context() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(Map::new(), 100))
    }

    /// Handler that fails the first `failures` calls, then returns the call number.
    fn flaky(id: &str, failures: usize) -> (NodeDefinition, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let node = NodeDefinition::from_fn(id, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    bail!("attempt {call} failed");
                }
                Ok(json!({ "call": call }))
            }
        });
        (node, calls)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (node, calls) = flaky("a", 0);
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;

        assert_eq!(outcome.status(), NodeStatus::Success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (node, _) = flaky("e", 2);
        let node = node.with_retry(2, Duration::from_millis(1));
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.result,
            NodeResult::Succeeded {
                output: json!({ "call": 3 }),
                recovered_from: None
            }
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let (node, calls) = flaky("x", 10);
        let node = node.with_retry(1, Duration::from_millis(1));
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.result,
            NodeResult::Failed(NodeError::Execution("attempt 2 failed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_per_attempt() {
        let node = NodeDefinition::from_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("late"))
        })
        .with_timeout(Duration::from_millis(20))
        .with_retry(1, Duration::from_millis(1));

        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            outcome.result,
            NodeResult::Failed(NodeError::Timeout { timeout_ms: 20 })
        );
    }

    #[tokio::test]
    async fn test_fallback_recovers() {
        let (node, _) = flaky("f", 10);
        let node = node.with_fallback(|err| Some(json!({ "fallback": err.to_string() })));
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;

        assert_eq!(outcome.status(), NodeStatus::Success);
        match outcome.result {
            NodeResult::Succeeded {
                output,
                recovered_from,
            } => {
                assert_eq!(output, json!({ "fallback": "attempt 1 failed" }));
                assert!(recovered_from.is_some());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_fallback_still_fails() {
        let (node, _) = flaky("f", 10);
        let node = node.with_fallback(|_| Some(Value::Null));
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;
        assert_eq!(outcome.status(), NodeStatus::Failed);
    }

    #[tokio::test]
    async fn test_false_condition_skips_without_calling_handler() {
        let (node, calls) = flaky("s", 0);
        let node = node.with_condition(|outputs| outputs.contains_key("never"));
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;

        assert_eq!(outcome.status(), NodeStatus::Skipped);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inputs_are_resolved_before_call() {
        let mut ctx = ExecutionContext::new(Map::new(), 100);
        ctx.set_output("g", json!({ "value": 42 })).unwrap();

        let node = NodeDefinition::from_fn("h", |inputs| async move { Ok(Value::Object(inputs)) })
            .with_input("x", "{{g.value}}");
        let outcome = runner(1).run(NodeJob::from_node(&node), Arc::new(ctx)).await;

        assert_eq!(
            outcome.result,
            NodeResult::Succeeded {
                output: json!({ "x": 42 }),
                recovered_from: None
            }
        );
    }

    #[tokio::test]
    async fn test_apply_writes_output_once() {
        let (mut node, _) = flaky("a", 0);
        let outcome = runner(1).run(NodeJob::from_node(&node), context()).await;
        let mut ctx = ExecutionContext::new(Map::new(), 100);

        outcome.clone().apply(&mut node, &mut ctx).unwrap();
        assert_eq!(node.status(), NodeStatus::Success);
        assert_eq!(ctx.output("a"), Some(&json!({ "call": 1 })));

        assert!(outcome.apply(&mut node, &mut ctx).is_err());
    }

    #[tokio::test]
    async fn test_events_follow_attempts() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let runner = NodeRunner::new(Uuid::nil(), Arc::new(Semaphore::new(1)), Some(bus));
        let (node, _) = flaky("e", 1);
        let node = node.with_retry(1, Duration::from_millis(1));

        runner.run(NodeJob::from_node(&node), context()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
        }
        assert_eq!(
            kinds,
            vec![
                json!("node_started"),
                json!("node_retrying"),
                json!("node_started"),
                json!("node_succeeded")
            ]
        );
    }
}
