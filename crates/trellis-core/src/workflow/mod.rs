//! Workflow definition, validation, and execution.
//!
//! - `node` / `retry`: node and edge definitions, the handler capability,
//!   and retry policies.
//! - `context`: run inputs, node outputs, and `{{ref}}` resolution.
//! - `graph`: dependency index, cycle detection, and readiness.
//! - `expression`: JEXL conditions for declarative `when` clauses.
//! - `runner` / `engine`: per-node state machine and the wave scheduler.
//! - `builder`: the `Workflow` container and its fluent construction API.
//! - `definition`: YAML documents built against a handler registry.
//! - `diagram`: Mermaid rendering.

pub mod builder;
pub mod context;
pub mod definition;
pub mod diagram;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod node;
pub mod retry;
pub mod runner;

pub use builder::Workflow;
pub use context::{ContextError, ExecutionContext};
pub use definition::{
    DefinitionError, HandlerRegistry, build_workflow, load_workflow_file, parse_workflow_yaml,
    serialize_workflow_yaml, validate_document,
};
pub use engine::{ExecutionResult, WorkflowEngine};
pub use expression::{WorkflowEvaluator, condition_from_expression};
pub use graph::DependencyGraph;
pub use node::{
    BoxHandler, Condition, EdgeDefinition, Fallback, FnHandler, NodeDefinition, NodeHandler,
    NodeState, Outputs, Transform, handler_fn,
};
pub use retry::RetryPolicy;
