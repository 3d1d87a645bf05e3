//! The `Workflow` aggregate: construction, execution, and introspection.
//!
//! A workflow owns its nodes (keyed by id, remembered in declaration order)
//! and its edge list. The dependency graph is derived lazily and rebuilt
//! whenever nodes or edges change. A built workflow can be run any number
//! of times; each run resets node state and gets a fresh context.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use trellis_types::config::EngineConfig;
use trellis_types::error::ValidationError;
use trellis_types::workflow::{
    EdgeKind, EdgeReport, NodeReport, NodeStatus, RunStatus, WorkflowStatus,
};

use crate::event::EventBus;

use super::diagram;
use super::engine::{ExecutionResult, WorkflowEngine};
use super::graph::DependencyGraph;
use super::node::{Condition, EdgeDefinition, NodeDefinition, Outputs, Transform};

#[derive(Clone)]
pub struct Workflow {
    name: String,
    pub(super) nodes: HashMap<String, NodeDefinition>,
    pub(super) order: Vec<String>,
    edges: Vec<EdgeDefinition>,
    /// Ids passed to `add_node` more than once; reported at validation.
    duplicates: Vec<String>,
    graph: Option<Arc<DependencyGraph>>,
    config: EngineConfig,
    events: Option<EventBus>,
    /// Seeded into every run's context before the first wave.
    pub(super) variables: HashMap<String, Value>,
    pub(super) last_run_status: Option<RunStatus>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            duplicates: Vec::new(),
            graph: None,
            config: EngineConfig::default(),
            events: None,
            variables: HashMap::new(),
            last_run_status: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.config.max_parallel = max_parallel;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Variables every run starts with. A bare `{{name}}` reference checks
    /// these before node outputs and run inputs.
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables.into_iter().collect();
        self
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.variables.insert(key.into(), value);
        self
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Add a node. A repeated id keeps the first definition and is reported
    /// as `DuplicateNodeId` when the workflow is validated.
    pub fn add_node(&mut self, node: NodeDefinition) -> &mut Self {
        if self.nodes.contains_key(&node.id) {
            tracing::warn!(workflow = %self.name, node_id = %node.id, "duplicate node id");
            self.duplicates.push(node.id);
        } else {
            self.order.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        self.graph = None;
        self
    }

    pub fn add_edge(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        kind: EdgeKind,
        condition: Option<Condition>,
        transform: Option<Transform>,
    ) -> &mut Self {
        self.add_edge_definition(EdgeDefinition {
            source: source.into(),
            target: target.into(),
            kind,
            condition,
            transform,
        })
    }

    pub fn add_edge_definition(&mut self, edge: EdgeDefinition) -> &mut Self {
        self.edges.push(edge);
        self.graph = None;
        self
    }

    /// Add a Conditional edge gated on `condition`.
    pub fn add_conditional_edge<F>(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: F,
    ) -> &mut Self
    where
        F: Fn(&Outputs) -> bool + Send + Sync + 'static,
    {
        self.add_edge(
            source,
            target,
            EdgeKind::Conditional,
            Some(Arc::new(condition)),
            None,
        )
    }

    /// Normal edges between each consecutive pair of `ids`.
    pub fn chain(&mut self, ids: &[&str]) -> &mut Self {
        for pair in ids.windows(2) {
            self.add_edge(pair[0], pair[1], EdgeKind::Normal, None, None);
        }
        self
    }

    /// Normal edges from `source` to each of `targets`.
    pub fn parallel(&mut self, source: &str, targets: &[&str]) -> &mut Self {
        for target in targets {
            self.add_edge(source, *target, EdgeKind::Normal, None, None);
        }
        self
    }

    /// Normal edges from each of `sources` to `target`.
    pub fn merge(&mut self, sources: &[&str], target: &str) -> &mut Self {
        for source in sources {
            self.add_edge(*source, target, EdgeKind::Normal, None, None);
        }
        self
    }

    // -----------------------------------------------------------------------
    // Validation & execution
    // -----------------------------------------------------------------------

    /// The dependency graph, rebuilt if nodes or edges changed since it was
    /// last derived.
    pub fn graph(&mut self) -> Arc<DependencyGraph> {
        let graph = self
            .graph
            .get_or_insert_with(|| Arc::new(DependencyGraph::build(&self.order, &self.edges)));
        Arc::clone(graph)
    }

    /// Check node ids, edge endpoints and acyclicity.
    pub fn validate(&mut self) -> Result<Arc<DependencyGraph>, ValidationError> {
        if let Some(id) = self.duplicates.first() {
            return Err(ValidationError::DuplicateNodeId(id.clone()));
        }
        let graph = self.graph();
        graph.validate()?;
        Ok(graph)
    }

    fn engine(&self) -> WorkflowEngine {
        WorkflowEngine::new(self.config.clone()).with_event_bus(self.events.clone())
    }

    /// Reset every node and run the workflow to completion or stall.
    pub async fn run(
        &mut self,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionResult, ValidationError> {
        self.engine().execute(self, inputs, None).await
    }

    /// Re-run `from` and everything downstream of it, keeping the state of
    /// every other node from the previous run.
    pub async fn resume(
        &mut self,
        inputs: Map<String, Value>,
        from: &str,
    ) -> Result<ExecutionResult, ValidationError> {
        self.engine().execute(self, inputs, Some(from)).await
    }

    /// Clear the runtime state of every node.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset();
        }
        self.last_run_status = None;
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[EdgeDefinition] {
        &self.edges
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(NodeDefinition::status)
    }

    /// Ids of nodes currently in `status`, in declaration order.
    pub fn ids_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.nodes()
            .filter(|node| node.status() == status)
            .map(|node| node.id.clone())
            .collect()
    }

    pub fn last_run_status(&self) -> Option<RunStatus> {
        self.last_run_status
    }

    /// Snapshot of every node's runtime state and every declared edge.
    pub fn status(&self) -> WorkflowStatus {
        let nodes = self
            .nodes()
            .map(|node| {
                let state = node.state();
                NodeReport {
                    id: node.id.clone(),
                    status: state.status,
                    output: state.output.clone(),
                    error: state.error.as_ref().map(ToString::to_string),
                    duration_ms: state.duration_ms(),
                    attempts: state.attempts,
                    started_at: state.started_at,
                    finished_at: state.finished_at,
                    metadata: node.metadata.clone(),
                }
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .map(|edge| EdgeReport {
                source: edge.source.clone(),
                target: edge.target.clone(),
                kind: edge.kind,
                conditional: edge.condition.is_some(),
                transform: edge.transform.is_some(),
            })
            .collect();

        WorkflowStatus {
            name: self.name.clone(),
            run_status: self.last_run_status,
            nodes,
            edges,
        }
    }

    /// Mermaid flowchart of the nodes (styled by status) and edges.
    pub fn to_diagram(&self) -> String {
        diagram::render(self)
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("nodes", &self.order)
            .field("edges", &self.edges.len())
            .field("config", &self.config)
            .finish()
    }
}
