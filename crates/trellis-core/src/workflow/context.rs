//! Per-run execution context with write-once outputs and reference resolution.
//!
//! `ExecutionContext` holds everything a run knows: the caller's inputs,
//! the output of every node that has succeeded so far, free-form variables,
//! and the scheduling iteration counter. Node inputs reach upstream data only
//! through whole-string `"{{ref}}"` references resolved here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::node::Outputs;

/// Errors raised by context mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("output for node '{0}' was already written in this run")]
    OutputAlreadySet(String),
}

/// Mutable state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Caller-supplied inputs.
    pub inputs: Map<String, Value>,
    /// Node outputs keyed by node id. Each id is written at most once.
    outputs: Outputs,
    /// Free-form values set by the embedding code.
    pub variables: HashMap<String, Value>,
    /// Scheduling loop iterations performed so far.
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>, max_iterations: u32) -> Self {
        Self {
            inputs,
            outputs: HashMap::new(),
            variables: HashMap::new(),
            iteration: 0,
            max_iterations,
            started_at: Utc::now(),
        }
    }

    /// Look up a bare name: variables first, then outputs, then inputs.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables
            .get(key)
            .or_else(|| self.outputs.get(key))
            .or_else(|| self.inputs.get(key))
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    /// Record a node's output. Fails if the node already has one this run.
    pub fn set_output(&mut self, node_id: &str, output: Value) -> Result<(), ContextError> {
        if self.outputs.contains_key(node_id) {
            return Err(ContextError::OutputAlreadySet(node_id.to_string()));
        }
        self.outputs.insert(node_id.to_string(), output);
        Ok(())
    }

    /// Resolve references in `value`.
    ///
    /// A string that is exactly `"{{ref}}"` (surrounding whitespace ignored)
    /// is replaced by what `ref` points to:
    /// - `name` looks up [`get`](Self::get);
    /// - `node.field` looks up `outputs[node][field]`, or the whole output
    ///   when it is not an object.
    ///
    /// Unresolvable references become `null`. Objects and arrays are resolved
    /// recursively; everything else is returned unchanged.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => match reference(s) {
                Some(reference) => self.lookup(reference),
                None => value.clone(),
            },
            Value::Object(map) => Value::Object(self.resolve_inputs(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            other => other.clone(),
        }
    }

    /// Resolve every value of an input map.
    pub fn resolve_inputs(&self, inputs: &Map<String, Value>) -> Map<String, Value> {
        inputs
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    fn lookup(&self, reference: &str) -> Value {
        match reference.split_once('.') {
            None => self.get(reference).cloned().unwrap_or(Value::Null),
            Some((node_id, field)) => match self.outputs.get(node_id) {
                Some(Value::Object(fields)) => fields.get(field).cloned().unwrap_or(Value::Null),
                Some(output) => output.clone(),
                None => Value::Null,
            },
        }
    }

    /// Serialize the context to JSON.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Extract `ref` from a string that is exactly `"{{ ref }}"`. Whitespace is
/// allowed inside the braces only.
fn reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    (!inner.is_empty()).then_some(inner)
}
