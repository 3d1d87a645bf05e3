//! Workflow document commands: validate, diagram, run, schema.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use trellis_core::event::EventBus;
use trellis_core::workflow::{
    DefinitionError, ExecutionResult, Workflow, build_workflow, load_workflow_file,
};
use trellis_types::config::EngineConfig;
use trellis_types::document::WorkflowDocument;
use trellis_types::event::WorkflowEvent;
use trellis_types::workflow::{NodeStatus, RunStatus};

use crate::handlers::builtin_registry;

/// Load a document and build it against the built-in handlers.
fn load(file: &Path, config: &EngineConfig) -> Result<Workflow> {
    let document = load_workflow_file(file).map_err(|e| match e {
        DefinitionError::Parse(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        DefinitionError::Validation(msg) => {
            anyhow::anyhow!("Workflow validation failed: {msg}")
        }
        other => anyhow::anyhow!("Failed to load {}: {other}", file.display()),
    })?;
    build_workflow(&document, &builtin_registry(), config)
        .with_context(|| format!("Failed to build workflow '{}'", document.name))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, config: &EngineConfig, json: bool) -> Result<()> {
    let mut workflow = load(file, config)?;
    workflow
        .validate()
        .with_context(|| format!("Workflow '{}' is invalid", workflow.name()))?;

    if json {
        let out = json!({
            "name": workflow.name(),
            "valid": true,
            "nodes": workflow.len(),
            "edges": workflow.edges().len(),
            "config": workflow.config(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(workflow.name()).cyan()
        );
        println!("  Nodes: {}", workflow.len());
        println!("  Edges: {}", workflow.edges().len());
        println!(
            "  Parallelism: {}  Fail fast: {}",
            workflow.config().max_parallel,
            workflow.config().fail_fast
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Diagram
// ---------------------------------------------------------------------------

pub fn handle_diagram(file: &Path, config: &EngineConfig, json: bool) -> Result<()> {
    let workflow = load(file, config)?;
    let diagram = workflow.to_diagram();
    if json {
        let out = json!({ "name": workflow.name(), "mermaid": diagram });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print!("{diagram}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Arguments of `trellis run`.
pub struct RunArgs<'a> {
    pub file: &'a Path,
    pub inputs: &'a [String],
    pub inputs_json: Option<&'a str>,
    pub resume_from: Option<&'a str>,
    pub events: bool,
}

/// Run a document; returns whether the final run succeeded.
pub async fn handle_run(args: RunArgs<'_>, config: &EngineConfig, json: bool) -> Result<bool> {
    let inputs = collect_inputs(args.inputs_json, args.inputs)?;
    let mut workflow = load(args.file, config)?;

    let printer = if args.events {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        workflow = workflow.with_event_bus(bus);
        let runs = if args.resume_from.is_some() { 2 } else { 1 };
        Some(tokio::spawn(print_events(rx, runs)))
    } else {
        None
    };

    let outcome = execute_runs(&mut workflow, inputs, args.resume_from, json).await;
    if let Some(printer) = printer {
        settle_printer(printer, outcome.is_ok()).await;
    }
    let result = outcome?;

    if json {
        let out = json!({
            "run_id": result.run_id.to_string(),
            "status": result.status,
            "success": result.is_success(),
            "duration_ms": result.duration_ms,
            "pending": result.pending,
            "failed": result.failed,
            "outputs": result.context.outputs(),
            "workflow": workflow.status(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_run(&workflow, &result);
    }
    Ok(result.is_success())
}

/// Run once, then resume from `resume_from` when given.
async fn execute_runs(
    workflow: &mut Workflow,
    inputs: Map<String, Value>,
    resume_from: Option<&str>,
    json: bool,
) -> Result<ExecutionResult> {
    let result = workflow
        .run(inputs.clone())
        .await
        .with_context(|| format!("Workflow '{}' failed validation", workflow.name()))?;

    let Some(from) = resume_from else {
        return Ok(result);
    };
    if !json {
        print_run(workflow, &result);
        println!(
            "  {} Resuming from '{}'",
            style(">").yellow().bold(),
            style(from).cyan()
        );
    }
    workflow
        .resume(inputs, from)
        .await
        .with_context(|| format!("Cannot resume from '{from}'"))
}

/// Wait for the event printer after successful runs. After a failure it may
/// still be waiting for a `RunFinished` that will never come, so abort it.
async fn settle_printer(printer: JoinHandle<()>, completed: bool) {
    if !completed {
        printer.abort();
    }
    match printer.await {
        Err(e) if !e.is_cancelled() => tracing::warn!("event printer stopped: {e}"),
        _ => {}
    }
}

/// Merge `--inputs` (a JSON object) with each `--input KEY=VALUE`.
pub fn collect_inputs(inputs_json: Option<&str>, pairs: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = match inputs_json {
        None => Map::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--inputs is not valid JSON")? {
            Value::Object(map) => map,
            other => bail!("--inputs must be a JSON object, got {other}"),
        },
    };
    for pair in pairs {
        let (key, value) = parse_input(pair)?;
        inputs.insert(key, value);
    }
    Ok(inputs)
}

/// Split `KEY=VALUE`, parsing VALUE as JSON and falling back to a string.
pub fn parse_input(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("input '{pair}' must look like KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("input '{pair}' has an empty key");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

async fn print_events(mut rx: broadcast::Receiver<WorkflowEvent>, runs: usize) {
    let mut finished = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
                if matches!(event, WorkflowEvent::RunFinished { .. }) {
                    finished += 1;
                    if finished == runs {
                        break;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_run(workflow: &Workflow, result: &ExecutionResult) {
    let status = workflow.status();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Output / Error"),
        ]);

    for node in &status.nodes {
        let detail = match (&node.output, &node.error) {
            (Some(output), Some(error)) => format!("{output} (recovered: {error})"),
            (Some(output), None) => output.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&node.id),
            format_node_status(node.status),
            Cell::new(node.attempts),
            Cell::new(format!("{}ms", node.duration_ms)),
            Cell::new(detail),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} Run {} {} in {}ms",
        run_marker(result),
        style(result.run_id.to_string().chars().take(8).collect::<String>()).dim(),
        format_run_status(result.status),
        result.duration_ms
    );
    if !result.failed.is_empty() {
        println!("  Failed: {}", style(result.failed.join(", ")).red());
    }
    if !result.pending.is_empty() {
        println!("  Pending: {}", style(result.pending.join(", ")).yellow());
    }
    println!();
}

fn run_marker(result: &ExecutionResult) -> console::StyledObject<&'static str> {
    if result.is_success() {
        style("*").green().bold()
    } else {
        style("!").red().bold()
    }
}

fn format_run_status(status: RunStatus) -> console::StyledObject<&'static str> {
    match status {
        RunStatus::Completed => style(status.as_str()).green(),
        RunStatus::Stalled => style(status.as_str()).yellow(),
        RunStatus::FailFastStopped => style(status.as_str()).red(),
    }
}

fn format_node_status(status: NodeStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        NodeStatus::Pending => cell.fg(Color::Yellow),
        NodeStatus::Running => cell.fg(Color::Blue),
        NodeStatus::Success => cell.fg(Color::Green),
        NodeStatus::Failed => cell.fg(Color::Red),
        NodeStatus::Skipped => cell.fg(Color::DarkGrey),
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

pub fn handle_schema() -> Result<()> {
    let schema = schemars::schema_for!(WorkflowDocument);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
