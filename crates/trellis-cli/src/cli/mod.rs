//! CLI command definitions for the `trellis` binary.
//!
//! Uses clap derive macros for argument parsing. Every command takes a
//! workflow document path except `schema`.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_FILE;

/// Validate, draw, and run DAG workflow documents.
#[derive(Parser)]
#[command(name = "trellis", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all log output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for engine debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Engine configuration file.
    #[arg(long, global = true, env = "TRELLIS_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow document: structure, handlers, edges, and cycles.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Print a Mermaid diagram of a workflow document.
    Diagram {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Run a workflow document with the built-in handlers.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Run input as KEY=VALUE; VALUE is parsed as JSON, else kept as a string.
        #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Run inputs as a JSON object, merged before any --input.
        #[arg(long = "inputs", value_name = "JSON")]
        inputs_json: Option<String>,

        /// After the first run, re-run this node and everything downstream of it.
        #[arg(long, value_name = "NODE")]
        resume_from: Option<String>,

        /// Print run events as JSON lines while the workflow executes.
        #[arg(long)]
        events: bool,
    },

    /// Print the JSON Schema of the workflow document format.
    Schema,
}
