//! Event types for the trellis run event bus.
//!
//! `WorkflowEvent` is broadcast while a run executes. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::RunStatus;

/// Lifecycle events emitted during a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        nodes: usize,
    },

    /// A node attempt is about to invoke its handler.
    NodeStarted {
        run_id: Uuid,
        node_id: String,
        attempt: u32,
    },

    /// An attempt failed and another one will follow after the retry delay.
    NodeRetrying {
        run_id: Uuid,
        node_id: String,
        attempt: u32,
        error: String,
    },

    NodeSucceeded {
        run_id: Uuid,
        node_id: String,
        attempts: u32,
        duration_ms: u64,
        /// True when the output came from the fallback rather than the handler.
        recovered: bool,
    },

    NodeSkipped { run_id: Uuid, node_id: String },

    NodeFailed {
        run_id: Uuid,
        node_id: String,
        attempts: u32,
        error: String,
    },

    RunFinished {
        run_id: Uuid,
        workflow: String,
        status: RunStatus,
        duration_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeSucceeded { run_id, .. }
            | Self::NodeSkipped { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeRetrying { node_id, .. }
            | Self::NodeSucceeded { node_id, .. }
            | Self::NodeSkipped { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(node_id),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_type_tag() {
        let run_id = Uuid::nil();
        let event = WorkflowEvent::NodeSkipped {
            run_id,
            node_id: "notify".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("node_skipped"));
        assert_eq!(value["node_id"], json!("notify"));
    }

    #[test]
    fn node_id_accessor() {
        let event = WorkflowEvent::RunFinished {
            run_id: Uuid::nil(),
            workflow: "w".to_string(),
            status: RunStatus::Completed,
            duration_ms: 3,
        };
        assert_eq!(event.node_id(), None);
        assert_eq!(event.run_id(), Uuid::nil());

        let event = WorkflowEvent::NodeStarted {
            run_id: Uuid::nil(),
            node_id: "a".to_string(),
            attempt: 1,
        };
        assert_eq!(event.node_id(), Some("a"));
    }
}
