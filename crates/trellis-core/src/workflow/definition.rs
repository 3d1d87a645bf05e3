//! Declarative workflow documents: parsing, validation, and building.
//!
//! A `WorkflowDocument` names handlers instead of carrying code. Building it
//! against a [`HandlerRegistry`] produces a runnable [`Workflow`]; `when`
//! strings become JEXL conditions.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use trellis_types::config::EngineConfig;
use trellis_types::document::{NodeSpec, WorkflowDocument};
use trellis_types::error::ValidationError;

use super::builder::Workflow;
use super::expression::condition_from_expression;
use super::node::{BoxHandler, EdgeDefinition, NodeDefinition, NodeHandler};
use super::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node '{node}' uses unknown handler '{handler}'")]
    UnknownHandler { node: String, handler: String },

    #[error(transparent)]
    Workflow(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and structurally validate a YAML workflow document.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDocument, DefinitionError> {
    let document: WorkflowDocument =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_document(&document)?;
    Ok(document)
}

pub fn serialize_workflow_yaml(document: &WorkflowDocument) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(document).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load a workflow document from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDocument, DefinitionError> {
    let yaml = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&yaml)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural checks that do not need a handler registry.
///
/// Graph-level problems (duplicate ids, dangling edges, cycles) are left to
/// `Workflow::validate` so documents and code-built workflows report them
/// the same way.
pub fn validate_document(document: &WorkflowDocument) -> Result<(), DefinitionError> {
    if document.name.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if document.nodes.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one node".to_string(),
        ));
    }
    if let Some(position) = document.nodes.iter().position(|n| n.id.trim().is_empty()) {
        return Err(DefinitionError::Validation(format!(
            "node #{} has an empty id",
            position + 1
        )));
    }
    if let Some(node) = document.nodes.iter().find(|n| n.timeout_ms == Some(0)) {
        return Err(DefinitionError::Validation(format!(
            "node '{}' has a zero timeout",
            node.id
        )));
    }
    if document.max_parallel == Some(0) {
        return Err(DefinitionError::Validation(
            "max_parallel must be >= 1".to_string(),
        ));
    }
    if document.max_iterations == Some(0) {
        return Err(DefinitionError::Validation(
            "max_iterations must be >= 1".to_string(),
        ));
    }
    if let Some(chain) = document.chains.iter().find(|c| c.len() < 2) {
        return Err(DefinitionError::Validation(format!(
            "chain {chain:?} needs at least two nodes"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Named handlers that documents refer to.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: NodeHandler>(&mut self, name: impl Into<String>, handler: H) -> &mut Self {
        self.register_boxed(name, BoxHandler::new(handler))
    }

    pub fn register_boxed(&mut self, name: impl Into<String>, handler: BoxHandler) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BoxHandler> {
        self.handlers.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Turn a document into a runnable workflow.
///
/// Scheduling settings declared in the document override `base`. Nodes
/// whose `retry` omits `delay_ms` use `default_retry_delay_ms`.
pub fn build_workflow(
    document: &WorkflowDocument,
    registry: &HandlerRegistry,
    base: &EngineConfig,
) -> Result<Workflow, DefinitionError> {
    validate_document(document)?;
    let config = base.overridden_by(document);
    let default_delay = Duration::from_millis(config.default_retry_delay_ms);

    let mut workflow = Workflow::new(document.name.clone()).with_config(config);
    for spec in &document.nodes {
        workflow.add_node(build_node(spec, registry, default_delay)?);
    }

    for edge in &document.edges {
        let mut definition = EdgeDefinition::new(&edge.source, &edge.target, edge.kind);
        if let Some(when) = &edge.when {
            definition = definition.with_condition(condition_from_expression(when));
        }
        workflow.add_edge_definition(definition);
    }

    for chain in &document.chains {
        let ids: Vec<&str> = chain.iter().map(String::as_str).collect();
        workflow.chain(&ids);
    }

    tracing::debug!(
        workflow = %document.name,
        nodes = document.nodes.len(),
        edges = workflow.edges().len(),
        "built workflow from document"
    );
    Ok(workflow)
}

fn build_node(
    spec: &NodeSpec,
    registry: &HandlerRegistry,
    default_delay: Duration,
) -> Result<NodeDefinition, DefinitionError> {
    let handler = registry
        .get(&spec.handler)
        .cloned()
        .ok_or_else(|| DefinitionError::UnknownHandler {
            node: spec.id.clone(),
            handler: spec.handler.clone(),
        })?;

    let mut node =
        NodeDefinition::with_handler(&spec.id, handler).with_inputs(to_map(&spec.inputs));
    for (key, value) in &spec.metadata {
        node = node.with_metadata(key, value.clone());
    }
    if let Some(when) = &spec.when {
        node.condition = Some(condition_from_expression(when));
    }
    if let Some(timeout_ms) = spec.timeout_ms {
        node = node.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(retry) = &spec.retry {
        let delay = retry
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(default_delay);
        node.retry = RetryPolicy::new(retry.count, delay);
    }
    if let Some(fallback) = spec.fallback.clone().filter(|v| !v.is_null()) {
        node = node.with_fallback(move |_| Some(fallback.clone()));
    }
    Ok(node)
}

fn to_map(values: &BTreeMap<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
