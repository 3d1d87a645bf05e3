//! Declarative workflow documents.
//!
//! A `WorkflowDocument` is the YAML form of a workflow: nodes name a handler
//! from a registry instead of carrying code, and conditions are JEXL strings
//! instead of closures. The core crate turns a document into a runnable
//! `Workflow`.
//!
//! ```yaml
//! name: report
//! max_parallel: 4
//! nodes:
//!   - id: fetch
//!     handler: http_get
//!     inputs: { url: "{{url}}" }
//!     retry: { count: 2, delay_ms: 500 }
//!   - id: summarize
//!     handler: llm
//!     inputs: { text: "{{fetch.body}}" }
//! edges:
//!   - source: fetch
//!     target: summarize
//!     kind: conditional
//!     when: "outputs.fetch.status == 200"
//! ```

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::EdgeKind;

/// The canonical declarative workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Overrides `EngineConfig::max_parallel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Overrides `EngineConfig::fail_fast`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    /// Overrides `EngineConfig::max_iterations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeSpec>,
    /// Shorthand for linear runs of normal edges: `[[a, b, c]]` adds a->b and b->c.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<Vec<String>>,
}

/// A node declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeSpec {
    pub id: String,
    /// Name of a handler in the registry the document is built against.
    pub handler: String,
    /// Literal values or whole-string `{{ref}}` references.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    /// JEXL predicate over `outputs`; the node is Skipped when it is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Output used when every attempt fails. `null` means no fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Retry policy declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetrySpec {
    /// Additional attempts after the first one.
    #[serde(default)]
    pub count: u32,
    /// Delay between attempts (falls back to the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

/// An edge declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: EdgeKind,
    /// JEXL predicate over `outputs` gating the target's readiness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}
