//! Built-in handlers available to workflow documents run from the CLI.
//!
//! | Name    | Behaviour                                                   |
//! |---------|-------------------------------------------------------------|
//! | `echo`  | Returns its resolved inputs as an object.                   |
//! | `value` | Returns input `value` (null when absent).                   |
//! | `sleep` | Sleeps `ms` milliseconds, then returns input `value`.       |
//! | `fail`  | Fails with input `message`.                                 |
//! | `flaky` | Fails the first `failures` calls (default 1), then succeeds |
//! |         | with input `value`.                                         |

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Map, Value};
use trellis_core::workflow::{HandlerRegistry, NodeHandler, handler_fn};

/// Registry holding every built-in handler.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "echo",
            handler_fn(|inputs: Map<String, Value>| async move { Ok(Value::Object(inputs)) }),
        )
        .register(
            "value",
            handler_fn(|inputs: Map<String, Value>| async move { Ok(value_input(&inputs)) }),
        )
        .register(
            "sleep",
            handler_fn(|inputs: Map<String, Value>| async move {
                let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value_input(&inputs))
            }),
        )
        .register(
            "fail",
            handler_fn(|inputs: Map<String, Value>| async move {
                let message = inputs
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("failed")
                    .to_string();
                Err::<Value, _>(anyhow!(message))
            }),
        )
        .register("flaky", FlakyHandler::default());
    registry
}

fn value_input(inputs: &Map<String, Value>) -> Value {
    inputs.get("value").cloned().unwrap_or(Value::Null)
}

/// Fails until it has been called more than `failures` times.
///
/// The call count is shared by every node using this registry entry, so two
/// flaky nodes in one document draw from the same budget.
#[derive(Debug, Default)]
pub struct FlakyHandler {
    calls: AtomicU64,
}

impl NodeHandler for FlakyHandler {
    fn call(
        &self,
        inputs: Map<String, Value>,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = inputs.get("failures").and_then(Value::as_u64).unwrap_or(1);
        async move {
            if call <= failures {
                return Err(anyhow!("flaky failure {call} of {failures}"));
            }
            Ok(value_input(&inputs))
        }
    }
}
