//! Node and edge definitions plus the handler capability.
//!
//! Handlers follow the same blanket-impl pattern used for other async
//! capabilities in this workspace:
//! 1. `NodeHandler` is the ergonomic trait with an `async fn`-style method.
//! 2. `NodeHandlerDyn` is its object-safe twin with boxed futures, blanket
//!    implemented for every `NodeHandler`.
//! 3. `BoxHandler` wraps `Arc<dyn NodeHandlerDyn>` so definitions stay
//!    cloneable and can be moved into spawned tasks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use trellis_types::error::NodeError;
use trellis_types::workflow::{EdgeKind, NodeStatus};

use super::retry::RetryPolicy;

/// Node outputs keyed by node id.
pub type Outputs = HashMap<String, Value>;

/// Predicate over the outputs produced so far in a run.
pub type Condition = Arc<dyn Fn(&Outputs) -> bool + Send + Sync>;

/// Output transform attached to an edge.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Recovery hook invoked with the last error once every attempt has failed.
/// Returning `Some(non-null)` turns the failure into a Success.
pub type Fallback = Arc<dyn Fn(&NodeError) -> Option<Value> + Send + Sync>;

// ---------------------------------------------------------------------------
// Handler capability
// ---------------------------------------------------------------------------

/// An opaque unit of async work: resolved inputs in, JSON value or error out.
pub trait NodeHandler: Send + Sync + 'static {
    fn call(
        &self,
        inputs: Map<String, Value>,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send;
}

/// Object-safe version of [`NodeHandler`] with a boxed future.
pub trait NodeHandlerDyn: Send + Sync {
    fn call_boxed(
        &self,
        inputs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + '_>>;
}

impl<T: NodeHandler> NodeHandlerDyn for T {
    fn call_boxed(
        &self,
        inputs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + '_>> {
        Box::pin(self.call(inputs))
    }
}

/// Type-erased, cheaply cloneable handler.
#[derive(Clone)]
pub struct BoxHandler {
    inner: Arc<dyn NodeHandlerDyn>,
}

impl BoxHandler {
    pub fn new<H: NodeHandler>(handler: H) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn call(&self, inputs: Map<String, Value>) -> anyhow::Result<Value> {
        self.inner.call_boxed(inputs).await
    }
}

impl fmt::Debug for BoxHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxHandler")
    }
}

/// A [`NodeHandler`] backed by a closure. Built with [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Adapt an async closure into a [`NodeHandler`].
///
/// ```ignore
/// let double = handler_fn(|inputs| async move {
///     let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
///     Ok(json!(x * 2))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn call(
        &self,
        inputs: Map<String, Value>,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send {
        (self.f)(inputs)
    }
}

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// Runtime state of a node, reset at the start of every run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeState {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<NodeError>,
    /// Handler invocations in the current run; 0 when the condition skipped it.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// Declarative unit of work plus its runtime state.
///
/// The definition half (handler, inputs, policies) is set at build time and
/// never changes; the [`NodeState`] half is owned by the engine during a run.
#[derive(Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub handler: BoxHandler,
    /// Literal values or whole-string `"{{ref}}"` references.
    pub inputs: Map<String, Value>,
    pub condition: Option<Condition>,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub fallback: Option<Fallback>,
    pub metadata: Map<String, Value>,
    pub(crate) state: NodeState,
}

impl NodeDefinition {
    pub fn new<H: NodeHandler>(id: impl Into<String>, handler: H) -> Self {
        Self::with_handler(id, BoxHandler::new(handler))
    }

    pub fn with_handler(id: impl Into<String>, handler: BoxHandler) -> Self {
        Self {
            id: id.into(),
            handler,
            inputs: Map::new(),
            condition: None,
            timeout: None,
            retry: RetryPolicy::default(),
            fallback: None,
            metadata: Map::new(),
            state: NodeState::default(),
        }
    }

    /// Shorthand for `NodeDefinition::new(id, handler_fn(f))`.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(id, handler_fn(f))
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Outputs) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry up to `count` extra times, sleeping `delay` between attempts.
    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy::new(count, delay);
        self
    }

    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&NodeError) -> Option<Value> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn status(&self) -> NodeStatus {
        self.state.status
    }

    pub(crate) fn reset(&mut self) {
        self.state = NodeState::default();
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("condition", &self.condition.is_some())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("fallback", &self.fallback.is_some())
            .field("state", &self.state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EdgeDefinition
// ---------------------------------------------------------------------------

/// A directed edge between two node ids. Immutable once added.
#[derive(Clone)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub condition: Option<Condition>,
    pub transform: Option<Transform>,
}

impl EdgeDefinition {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            condition: None,
            transform: None,
        }
    }

    pub fn normal(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeKind::Normal)
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Whether this edge gates its target's readiness on a predicate.
    pub fn gates_readiness(&self) -> bool {
        self.kind.is_dependency() && self.condition.is_some()
    }
}

impl fmt::Debug for EdgeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeDefinition")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("condition", &self.condition.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}
