use thiserror::Error;

/// Structural problems that make a workflow unrunnable.
///
/// These are the only errors `run()` ever returns; they are raised before
/// any node executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("edge '{from}' -> '{to}' references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("cycle detected involving node '{node}'")]
    CycleDetected { node: String },

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Failure of a single node attempt.
///
/// Recorded on the node when every attempt is exhausted; never propagated
/// out of a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("{0}")]
    Execution(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}
