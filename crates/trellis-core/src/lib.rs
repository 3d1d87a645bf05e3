//! DAG workflow engine for trellis.
//!
//! A [`Workflow`](workflow::Workflow) owns node definitions and edges. Each
//! `run()` validates the graph, then repeatedly dispatches every ready node
//! as one concurrent wave under a run-wide parallelism bound, folding
//! outputs back into the [`ExecutionContext`](workflow::ExecutionContext)
//! until the graph completes, stalls, or stops on a failure.
//!
//! Node handlers are opaque: the engine only sees resolved inputs going in
//! and a JSON value or an error coming out.

pub mod event;
pub mod workflow;

pub use workflow::{
    BoxHandler, EdgeDefinition, ExecutionContext, ExecutionResult, NodeDefinition, NodeHandler,
    Workflow, handler_fn,
};
