//! Readiness-driven wave scheduler.
//!
//! Each loop iteration asks the [`DependencyGraph`] which Pending nodes are
//! ready, dispatches all of them as one wave into a `JoinSet`, and waits for
//! the whole wave before re-evaluating readiness. A single semaphore of
//! `max_parallel` permits is shared by every wave of the run.
//!
//! Because the loop only proceeds once a wave has fully joined, no node is
//! ever Running while readiness is computed, so an empty ready set always
//! means the run is either Completed or Stalled.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;
use trellis_types::config::EngineConfig;
use trellis_types::error::{NodeError, ValidationError};
use trellis_types::event::WorkflowEvent;
use trellis_types::workflow::{NodeStatus, RunStatus};
use uuid::Uuid;

use crate::event::EventBus;

use super::builder::Workflow;
use super::context::ExecutionContext;
use super::graph::DependencyGraph;
use super::runner::{NodeJob, NodeRunner};

/// What a finished run hands back to the caller.
///
/// Node-level failures never surface as errors; callers inspect `status`,
/// `failed` and `pending` to tell full completion from partial results.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub context: ExecutionContext,
    /// Nodes still Pending when the run stopped, in declaration order.
    pub pending: Vec<String>,
    /// Nodes that ended Failed, in declaration order.
    pub failed: Vec<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Completed with no Failed node.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failed.is_empty()
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.context.output(node_id)
    }
}

/// Drives runs of a [`Workflow`] under one [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowEngine {
    config: EngineConfig,
    events: Option<EventBus>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    pub fn with_event_bus(mut self, events: Option<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Validate, reset (or prepare a resume), then run until the workflow
    /// completes, stalls, or stops on a failure.
    ///
    /// Only validation problems are returned as errors, and they are raised
    /// before any node executes.
    pub async fn execute(
        &self,
        workflow: &mut Workflow,
        inputs: Map<String, Value>,
        resume_from: Option<&str>,
    ) -> Result<ExecutionResult, ValidationError> {
        self.config.validate()?;
        let graph = workflow.validate()?;

        let mut ctx = ExecutionContext::new(inputs, self.config.max_iterations);
        ctx.variables = workflow.variables.clone();
        match resume_from {
            None => workflow.reset(),
            Some(from) => prepare_resume(workflow, &graph, from, &mut ctx)?,
        }

        let run_id = Uuid::now_v7();
        let span = tracing::info_span!(
            "workflow_run",
            run_id = %run_id,
            workflow = %workflow.name(),
        );
        Ok(self
            .drive(workflow, &graph, ctx, run_id, resume_from)
            .instrument(span)
            .await)
    }

    async fn drive(
        &self,
        workflow: &mut Workflow,
        graph: &DependencyGraph,
        ctx: ExecutionContext,
        run_id: Uuid,
        resume_from: Option<&str>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut ctx = Arc::new(ctx);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let runner = NodeRunner::new(run_id, semaphore, self.events.clone());

        tracing::info!(
            nodes = workflow.len(),
            max_parallel = self.config.max_parallel,
            fail_fast = self.config.fail_fast,
            resume_from,
            "workflow run started"
        );
        self.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow: workflow.name().to_string(),
            nodes: workflow.len(),
        });

        let status = loop {
            let iteration = {
                let ctx = Arc::make_mut(&mut ctx);
                ctx.iteration += 1;
                ctx.iteration
            };
            if iteration > ctx.max_iterations {
                tracing::warn!(
                    max_iterations = ctx.max_iterations,
                    "iteration limit reached, stopping run"
                );
                break RunStatus::Stalled;
            }

            let ready = graph.ready_nodes(&workflow.nodes, ctx.outputs());
            if ready.is_empty() {
                let pending = workflow.ids_with_status(NodeStatus::Pending);
                if pending.is_empty() {
                    break RunStatus::Completed;
                }
                tracing::warn!(pending = ?pending, "no pending node can become ready, run stalled");
                break RunStatus::Stalled;
            }

            tracing::debug!(wave = iteration, nodes = ?ready, "dispatching wave");
            self.run_wave(workflow, &runner, &ready, &mut ctx).await;

            if self.config.fail_fast {
                let failed: Vec<&String> = ready
                    .iter()
                    .filter(|id| workflow.node_status(id) == Some(NodeStatus::Failed))
                    .collect();
                if !failed.is_empty() {
                    tracing::warn!(failed = ?failed, "node failed with fail_fast set, stopping run");
                    break RunStatus::FailFastStopped;
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let pending = workflow.ids_with_status(NodeStatus::Pending);
        let failed = workflow.ids_with_status(NodeStatus::Failed);
        workflow.last_run_status = Some(status);

        tracing::info!(
            status = %status,
            success = workflow.ids_with_status(NodeStatus::Success).len(),
            skipped = workflow.ids_with_status(NodeStatus::Skipped).len(),
            failed = failed.len(),
            pending = pending.len(),
            duration_ms,
            "workflow run finished"
        );
        self.publish(WorkflowEvent::RunFinished {
            run_id,
            workflow: workflow.name().to_string(),
            status,
            duration_ms,
        });

        ExecutionResult {
            run_id,
            status,
            context: Arc::unwrap_or_clone(ctx),
            pending,
            failed,
            duration_ms,
        }
    }

    /// Dispatch one wave and fold every outcome back into the workflow and
    /// context once all of its tasks have joined.
    async fn run_wave(
        &self,
        workflow: &mut Workflow,
        runner: &NodeRunner,
        ready: &[String],
        ctx: &mut Arc<ExecutionContext>,
    ) {
        let mut join_set = JoinSet::new();
        let mut in_flight: HashMap<String, Arc<AtomicU32>> = HashMap::new();

        for id in ready {
            let Some(node) = workflow.nodes.get_mut(id) else {
                continue;
            };
            node.state.status = NodeStatus::Running;
            node.state.started_at = Some(Utc::now());

            let job = NodeJob::from_node(node);
            in_flight.insert(id.clone(), Arc::clone(&job.attempts));
            let runner = runner.clone();
            let snapshot = Arc::clone(ctx);
            join_set.spawn(async move { runner.run(job, snapshot).await });
        }

        let mut aborted = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    in_flight.remove(&outcome.node_id);
                    let Some(node) = workflow.nodes.get_mut(&outcome.node_id) else {
                        continue;
                    };
                    let node_id = outcome.node_id.clone();
                    if let Err(e) = outcome.apply(node, Arc::make_mut(ctx)) {
                        tracing::error!(node_id = %node_id, error = %e, "discarding duplicate output");
                        node.state.status = NodeStatus::Failed;
                        node.state.error = Some(NodeError::Execution(e.to_string()));
                    }
                }
                Err(e) => aborted.push(join_error_message(e)),
            }
        }

        // Tasks that joined without an outcome panicked or were cancelled.
        let single_cause = (aborted.len() == 1).then(|| aborted[0].clone());
        for (id, attempts) in in_flight {
            let Some(node) = workflow.nodes.get_mut(&id) else {
                continue;
            };
            let message = single_cause
                .clone()
                .unwrap_or_else(|| "node task terminated without a result".to_string());
            tracing::error!(node_id = %id, error = %message, "node task panicked");
            node.state.status = NodeStatus::Failed;
            node.state.attempts = attempts.load(Ordering::SeqCst);
            node.state.finished_at = Some(Utc::now());
            node.state.error = Some(NodeError::Panicked(message));
        }
    }
}

fn join_error_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Reset `from` and everything downstream of it, keep every other node's
/// state, and seed kept Success outputs into the fresh context.
fn prepare_resume(
    workflow: &mut Workflow,
    graph: &DependencyGraph,
    from: &str,
    ctx: &mut ExecutionContext,
) -> Result<(), ValidationError> {
    if workflow.node(from).is_none() {
        return Err(ValidationError::UnknownNode(from.to_string()));
    }

    let mut rerun: BTreeSet<String> = graph.downstream_of(from);
    rerun.insert(from.to_string());

    for id in workflow.order.clone() {
        let Some(node) = workflow.nodes.get_mut(&id) else {
            continue;
        };
        if rerun.contains(&id) || node.status() == NodeStatus::Running {
            node.reset();
            continue;
        }
        let Some(output) = node
            .state
            .output
            .clone()
            .filter(|_| node.status() == NodeStatus::Success)
        else {
            continue;
        };
        if let Err(e) = ctx.set_output(&id, output) {
            tracing::warn!(node_id = %id, error = %e, "could not re-seed output");
        }
    }

    tracing::info!(
        resume_from = from,
        rerun = rerun.len(),
        "prepared resume"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use anyhow::{anyhow, bail};
    use serde_json::json;
    use trellis_types::workflow::EdgeKind;

    use crate::workflow::node::{NodeDefinition, Outputs};

    fn constant(id: &str, value: Value) -> NodeDefinition {
        NodeDefinition::from_fn(id, move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn failing(id: &str) -> NodeDefinition {
        let message = format!("{id} exploded");
        NodeDefinition::from_fn(id, move |_| {
            let message = message.clone();
            async move { Err::<Value, _>(anyhow!(message)) }
        })
    }

    /// Records the order in which nodes start into `log`.
    fn logged(id: &str, log: &Arc<Mutex<Vec<String>>>, delay: Duration) -> NodeDefinition {
        let log = Arc::clone(log);
        let name = id.to_string();
        NodeDefinition::from_fn(id, move |_| {
            let log = Arc::clone(&log);
            let name = name.clone();
            async move {
                log.lock().unwrap().push(name.clone());
                tokio::time::sleep(delay).await;
                Ok(json!(name))
            }
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_fan_out_runs_in_one_wave() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let branch = |id: &str| {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            NodeDefinition::from_fn(id, move |_| {
                let active = Arc::clone(&active);
                let overlap = Arc::clone(&overlap);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    overlap.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!("done"))
                }
            })
        };

        let mut wf = Workflow::new("fan-out").with_max_parallel(2);
        wf.add_node(constant("A", json!(1)))
            .add_node(branch("B"))
            .add_node(branch("C"))
            .parallel("A", &["B", "C"]);

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.is_success());
        assert_eq!(overlap.load(Ordering::SeqCst), 2, "B and C overlap");
        // A's wave, the B/C wave, then the final readiness check.
        assert_eq!(result.context.iteration, 3);
        for id in ["A", "B", "C"] {
            assert_eq!(wf.node_status(id), Some(NodeStatus::Success));
        }
    }

    #[tokio::test]
    async fn test_scenario_closed_conditional_edge_stalls() {
        let mut wf = Workflow::new("gate");
        wf.add_node(constant("C", json!("stop")))
            .add_node(constant("D", json!("ran")))
            .add_conditional_edge("C", "D", |outputs: &Outputs| {
                outputs.get("C") == Some(&json!("go"))
            });

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Stalled);
        assert_eq!(result.pending, vec!["D"]);
        assert_eq!(wf.node_status("D"), Some(NodeStatus::Pending));
        assert!(result.output("D").is_none());
    }

    #[tokio::test]
    async fn test_scenario_retry_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let node = NodeDefinition::from_fn("E", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    bail!("transient failure {call}");
                }
                Ok(json!({ "attempt": call }))
            }
        })
        .with_retry(2, Duration::from_millis(5));

        let mut wf = Workflow::new("retry");
        wf.add_node(node);

        let result = wf.run(Map::new()).await.unwrap();
        assert!(result.is_success());
        let report = wf.status();
        let e = report.node("E").unwrap();
        assert_eq!(e.status, NodeStatus::Success);
        assert_eq!(e.attempts, 3);
        assert_eq!(result.output("E"), Some(&json!({ "attempt": 3 })));
    }

    #[tokio::test]
    async fn test_scenario_fail_fast_stops_after_wave() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let after_g = NodeDefinition::from_fn("after_g", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        let mut wf = Workflow::new("fail-fast").with_fail_fast(true);
        wf.add_node(failing("F"))
            .add_node(constant("G", json!("ok")))
            .add_node(after_g)
            .chain(&["G", "after_g"]);

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::FailFastStopped);
        assert_eq!(result.failed, vec!["F"]);
        assert_eq!(result.pending, vec!["after_g"]);
        assert_eq!(wf.node_status("G"), Some(NodeStatus::Success));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scenario_reference_wiring() {
        let mut wf = Workflow::new("wiring");
        wf.add_node(constant("G", json!({ "value": 42 })))
            .add_node(
                NodeDefinition::from_fn("H", |inputs| async move { Ok(Value::Object(inputs)) })
                    .with_input("x", "{{G.value}}"),
            )
            .chain(&["G", "H"]);

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.output("H"), Some(&json!({ "x": 42 })));
    }

    #[tokio::test]
    async fn test_run_variables_shadow_outputs_and_inputs() {
        let mut vars = Map::new();
        vars.insert("name".to_string(), json!("from-variable"));
        let mut wf = Workflow::new("variables").with_variables(vars);
        wf.add_node(constant("name", json!("from-output")))
            .add_node(
                NodeDefinition::from_fn("reader", |inputs| async move { Ok(Value::Object(inputs)) })
                    .with_input("who", "{{name}}")
                    .with_input("region", "{{region}}"),
            )
            .chain(&["name", "reader"]);
        wf.set_variable("region", json!("eu"));

        let mut inputs = Map::new();
        inputs.insert("name".to_string(), json!("from-input"));
        let result = wf.run(inputs).await.unwrap();

        assert_eq!(
            result.output("reader"),
            Some(&json!({ "who": "from-variable", "region": "eu" }))
        );
        assert_eq!(result.context.get("name"), Some(&json!("from-variable")));
    }

    #[tokio::test]
    async fn test_without_fail_fast_blocked_dependents_stall() {
        let mut wf = Workflow::new("partial").with_fail_fast(false);
        wf.add_node(failing("bad"))
            .add_node(constant("after_bad", json!(1)))
            .add_node(constant("independent", json!(2)))
            .chain(&["bad", "after_bad"]);

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Stalled);
        assert_eq!(result.failed, vec!["bad"]);
        assert_eq!(result.pending, vec!["after_bad"]);
        assert_eq!(wf.node_status("independent"), Some(NodeStatus::Success));
        let report = wf.status();
        assert_eq!(report.node("bad").unwrap().error.as_deref(), Some("bad exploded"));
    }

    #[tokio::test]
    async fn test_skipped_node_satisfies_dependents() {
        let mut wf = Workflow::new("skip");
        wf.add_node(constant("check", json!(false)))
            .add_node(
                constant("notify", json!("sent"))
                    .with_condition(|outputs| outputs.get("check") == Some(&json!(true))),
            )
            .add_node(constant("finish", json!("done")))
            .chain(&["check", "notify", "finish"]);

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(wf.node_status("notify"), Some(NodeStatus::Skipped));
        assert!(result.output("notify").is_none());
        assert_eq!(result.output("finish"), Some(&json!("done")));
        let report = wf.status();
        assert_eq!(report.node("notify").map(|n| n.attempts), Some(0));
        assert_eq!(report.node("finish").map(|n| n.attempts), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut wf = Workflow::new("bounded").with_max_parallel(3);
        wf.add_node(constant("root", json!(0)));
        let mut leaves = Vec::new();
        for i in 0..12 {
            let id = format!("leaf{i}");
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            wf.add_node(NodeDefinition::from_fn(id.clone(), move |_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(now))
                }
            }));
            leaves.push(id);
        }
        let targets: Vec<&str> = leaves.iter().map(String::as_str).collect();
        wf.parallel("root", &targets);

        let result = wf.run(Map::new()).await.unwrap();
        assert!(result.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_dispatch_follows_declaration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut wf = Workflow::new("ordered").with_max_parallel(1);
        for id in ["c", "a", "b"] {
            wf.add_node(logged(id, &log, Duration::ZERO));
        }

        wf.run(Map::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let mut wf = Workflow::new("repeat");
        wf.add_node(constant("a", json!({ "n": 1 })))
            .add_node(
                NodeDefinition::from_fn("b", |inputs| async move { Ok(Value::Object(inputs)) })
                    .with_input("n", "{{a.n}}")
                    .with_input("who", "{{user}}"),
            )
            .chain(&["a", "b"]);

        let mut inputs = Map::new();
        inputs.insert("user".to_string(), json!("ada"));

        let first = wf.run(inputs.clone()).await.unwrap();
        let first_status = wf.status();
        wf.reset();
        let second = wf.run(inputs).await.unwrap();

        assert_eq!(first.context.outputs(), second.context.outputs());
        let strip = |mut status: trellis_types::workflow::WorkflowStatus| {
            for node in &mut status.nodes {
                node.started_at = None;
                node.finished_at = None;
                node.duration_ms = 0;
            }
            status
        };
        assert_eq!(strip(first_status), strip(wf.status()));
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_validation_errors_before_any_node_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut wf = Workflow::new("cyclic");
        wf.add_node(NodeDefinition::from_fn("a", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }))
        .add_node(constant("b", json!(1)))
        .chain(&["a", "b", "a"]);

        let err = wf.run(Map::new()).await.unwrap_err();
        assert_eq!(err, ValidationError::CycleDetected { node: "a".to_string() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_dangling_rejected() {
        let mut wf = Workflow::new("dup");
        wf.add_node(constant("a", json!(1))).add_node(constant("a", json!(2)));
        assert_eq!(
            wf.run(Map::new()).await.unwrap_err(),
            ValidationError::DuplicateNodeId("a".to_string())
        );

        let mut wf = Workflow::new("dangling");
        wf.add_node(constant("a", json!(1))).chain(&["a", "ghost"]);
        assert!(matches!(
            wf.run(Map::new()).await.unwrap_err(),
            ValidationError::DanglingEdge { missing, .. } if missing == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let mut wf = Workflow::new("zero").with_max_parallel(0);
        wf.add_node(constant("a", json!(1)));
        assert!(matches!(
            wf.run(Map::new()).await,
            Err(ValidationError::InvalidSetting(_))
        ));
    }

    #[tokio::test]
    async fn test_iteration_limit_stalls() {
        let config = EngineConfig {
            max_iterations: 2,
            ..EngineConfig::default()
        };
        let mut wf = Workflow::new("long").with_config(config);
        wf.add_node(constant("a", json!(1)))
            .add_node(constant("b", json!(2)))
            .add_node(constant("c", json!(3)))
            .chain(&["a", "b", "c"]);

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Stalled);
        assert_eq!(result.pending, vec!["c"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let mut wf = Workflow::new("panic").with_fail_fast(false);
        wf.add_node(NodeDefinition::from_fn("boom", |_| async {
            if true {
                panic!("handler blew up");
            }
            Ok(Value::Null)
        }))
        .add_node(constant("fine", json!("ok")));

        let result = wf.run(Map::new()).await.unwrap();
        assert_eq!(result.failed, vec!["boom"]);
        assert_eq!(wf.node_status("fine"), Some(NodeStatus::Success));
        assert_eq!(
            wf.node("boom").unwrap().state().error,
            Some(NodeError::Panicked("handler blew up".to_string()))
        );
        assert_eq!(wf.node("boom").unwrap().state().attempts, 1);
    }

    #[tokio::test]
    async fn test_resume_reruns_only_downstream() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut wf = Workflow::new("resume").with_fail_fast(false);
        wf.add_node(logged("extract", &log, Duration::ZERO))
            .add_node(logged("transform", &log, Duration::ZERO))
            .add_node(logged("load", &log, Duration::ZERO))
            .add_node(logged("audit", &log, Duration::ZERO))
            .chain(&["extract", "transform", "load"])
            .chain(&["extract", "audit"]);

        wf.run(Map::new()).await.unwrap();
        log.lock().unwrap().clear();

        let result = wf.resume(Map::new(), "transform").await.unwrap();
        assert!(result.is_success());
        assert_eq!(*log.lock().unwrap(), vec!["transform", "load"]);
        // Kept outputs stay visible to references.
        assert_eq!(result.output("extract"), Some(&json!("extract")));
    }

    #[tokio::test]
    async fn test_resume_unknown_node_rejected() {
        let mut wf = Workflow::new("resume");
        wf.add_node(constant("a", json!(1)));
        assert_eq!(
            wf.resume(Map::new(), "nope").await.unwrap_err(),
            ValidationError::UnknownNode("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_loop_edges_do_not_block() {
        let mut wf = Workflow::new("loop");
        wf.add_node(constant("a", json!(1)))
            .add_node(constant("b", json!(2)))
            .chain(&["a", "b"])
            .add_edge("b", "a", EdgeKind::Loop, None, None);

        let result = wf.run(Map::new()).await.unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let mut wf = Workflow::new("events").with_event_bus(bus);
        wf.add_node(constant("a", json!(1)));

        let result = wf.run(Map::new()).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(WorkflowEvent::RunStarted { nodes: 1, .. })));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::RunFinished { status: RunStatus::Completed, .. })
        ));
        assert!(events.iter().all(|e| e.run_id() == result.run_id));
    }

    #[tokio::test]
    async fn test_cloned_workflows_run_concurrently_with_isolated_state() {
        let mut template = Workflow::new("shared");
        template
            .add_node(NodeDefinition::from_fn("echo", |inputs| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Value::Object(inputs))
            })
            .with_input("who", "{{who}}"));

        let mut left = template.clone();
        let mut right = template.clone();
        let mut left_inputs = Map::new();
        left_inputs.insert("who".to_string(), json!("left"));
        let mut right_inputs = Map::new();
        right_inputs.insert("who".to_string(), json!("right"));

        let (l, r) = tokio::join!(left.run(left_inputs), right.run(right_inputs));
        assert_eq!(l.unwrap().output("echo"), Some(&json!({ "who": "left" })));
        assert_eq!(r.unwrap().output("echo"), Some(&json!({ "who": "right" })));
        assert_eq!(template.node_status("echo"), Some(NodeStatus::Pending));
    }
}
