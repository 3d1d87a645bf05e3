//! trellis command-line entry point.
//!
//! Binary name: `trellis`
//!
//! Parses CLI arguments, sets up tracing, loads the engine configuration,
//! then dispatches to the requested command. `run` exits non-zero unless
//! the workflow completed with no failed node.

mod cli;
mod config;
mod handlers;

use std::process::ExitCode;

use clap::Parser;
use trellis_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::workflow::RunArgs;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Log verbosity; RUST_LOG still wins when set.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,trellis_core=debug",
        _ => "trace",
    };
    init_tracing(&TracingOptions {
        otel: cli.otel,
        json: cli.json,
        default_filter: filter.to_string(),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = dispatch(&cli).await;
    shutdown_tracing();
    outcome
}

async fn dispatch(cli: &Cli) -> anyhow::Result<ExitCode> {
    let engine_config = config::load_engine_config(&cli.config).await;
    tracing::debug!(?engine_config, path = %cli.config.display(), "loaded engine config");

    match &cli.command {
        Commands::Validate { file } => {
            cli::workflow::handle_validate(file, &engine_config, cli.json)?;
        }

        Commands::Diagram { file } => {
            cli::workflow::handle_diagram(file, &engine_config, cli.json)?;
        }

        Commands::Run {
            file,
            inputs,
            inputs_json,
            resume_from,
            events,
        } => {
            let args = RunArgs {
                file,
                inputs,
                inputs_json: inputs_json.as_deref(),
                resume_from: resume_from.as_deref(),
                events: *events,
            };
            if !cli::workflow::handle_run(args, &engine_config, cli.json).await? {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Schema => cli::workflow::handle_schema()?,
    }

    Ok(ExitCode::SUCCESS)
}
