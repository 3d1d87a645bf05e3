//! Workflow status vocabulary and introspection reports.
//!
//! Nodes move monotonically through `Pending -> Running -> {Success | Failed |
//! Skipped}` within a run. The reports here are the read-only snapshot that
//! `Workflow::status()` hands to callers after (or between) runs.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Node status
// ---------------------------------------------------------------------------

/// Lifecycle state of a single node within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Whether downstream nodes may treat this dependency as satisfied.
    ///
    /// Skipped counts as satisfied; Failed never does.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Edge kind
// ---------------------------------------------------------------------------

/// The kind of dependency an edge declares.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Plain ordering dependency.
    #[default]
    Normal,
    /// Dependency that additionally gates on a predicate over upstream outputs.
    Conditional,
    /// Back-reference for looping constructs. Never blocks readiness and is
    /// excluded from cycle detection.
    Loop,
}

impl EdgeKind {
    /// Whether this edge contributes to the dependency graph.
    pub fn is_dependency(self) -> bool {
        !matches!(self, Self::Loop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Terminal state of a whole workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No node is Pending or Running. Individual nodes may still be Failed
    /// or Skipped.
    Completed,
    /// Pending nodes remain but none can become ready, or the iteration cap
    /// was hit.
    Stalled,
    /// `fail_fast` was set and a wave contained a Failed node.
    FailFastStopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stalled => "stalled",
            Self::FailFastStopped => "fail_fast_stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Snapshot of one node's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time between the node starting and finishing (0 if it never finished).
    pub duration_ms: u64,
    /// Number of handler invocations in the last run. A node skipped by its
    /// condition never calls its handler and reports 0.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Description of one declared edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeReport {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    /// Whether the edge carries a readiness predicate.
    pub conditional: bool,
    /// Whether the edge carries an output transform.
    pub transform: bool,
}

/// Full introspection snapshot of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub name: String,
    /// Terminal status of the most recent run (None before the first run).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_status: Option<RunStatus>,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeReport>,
    pub edges: Vec<EdgeReport>,
}

impl WorkflowStatus {
    /// Look up a node report by id.
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Count nodes currently in `status`.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}
