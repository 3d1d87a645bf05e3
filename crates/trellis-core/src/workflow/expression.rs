//! JEXL conditions for declarative workflows.
//!
//! Document `when` clauses are JEXL expressions evaluated against
//! `{"outputs": {<node_id>: <output>, ...}}`. Outputs are always passed as
//! the evaluation context and never spliced into the expression text.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::node::{Condition, Outputs};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with the standard transforms registered.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!args.first().is_some_and(value_to_bool)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` and coerce the result with JS-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|value| value_to_bool(&value))
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate against node outputs exposed as `outputs.<node_id>`.
    pub fn evaluate_outputs(&self, expression: &str, outputs: &Outputs) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, &outputs_context(outputs))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the `{"outputs": {...}}` evaluation context.
pub fn outputs_context(outputs: &Outputs) -> Value {
    let outputs: Map<String, Value> = outputs
        .iter()
        .map(|(id, output)| (id.clone(), output.clone()))
        .collect();
    json!({ "outputs": outputs })
}

pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Turn a JEXL expression into a [`Condition`].
///
/// The evaluator is built once and shared by every check of the condition.
/// Evaluation errors count as `false` and are logged.
pub fn condition_from_expression(expression: impl Into<String>) -> Condition {
    let expression = expression.into();
    let evaluator = WorkflowEvaluator::new();
    Arc::new(move |outputs: &Outputs| {
        match evaluator.evaluate_outputs(&expression, outputs) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(expression = %expression, error = %e, "condition evaluation failed, treating as false");
                false
            }
        }
    })
}
