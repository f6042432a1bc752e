// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use clap::Parser;
use miette::{IntoDiagnostic, WrapErr};
use qse::{logging, Executor, HostValue, RunResult, ZeroBackend};
use std::path::PathBuf;

/// Symbolically executes a QIR file against a deterministic stand-in
/// backend and prints the result.
#[derive(Debug, Parser)]
#[command(name = "qse", version, about)]
struct Cli {
    /// The `.ll` or `.bc` file to run.
    file: PathBuf,

    /// Entry arguments: integers, floats, `true`/`false`, or strings.
    #[arg(short, long)]
    args: Vec<String>,

    /// Abort after this many executed instructions.
    #[arg(long)]
    step_limit: Option<u64>,

    /// Print each function's execution graph.
    #[arg(long)]
    trace_graphs: bool,

    /// Log value resolutions, branch decisions, and built circuits.
    #[arg(long)]
    trace_projections: bool,

    /// Log every step the engine takes.
    #[arg(long)]
    trace_runtime: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_arg(raw: &str) -> HostValue {
    if raw == "true" {
        HostValue::Bool(true)
    } else if raw == "false" {
        HostValue::Bool(false)
    } else if let Ok(i) = raw.parse::<i64>() {
        HostValue::Int(i)
    } else if let Ok(d) = raw.parse::<f64>() {
        HostValue::Double(d)
    } else {
        HostValue::String(raw.to_string())
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    match &cli.log_file {
        Some(path) => logging::initialize_file_logger(path),
        None => logging::initialize_commandline_logger(),
    }

    let mut executor = Executor::new(Box::new(ZeroBackend::default()));
    if let Some(limit) = cli.step_limit {
        executor.step_count_limit(limit);
    }
    if cli.trace_graphs {
        executor.trace_graphs();
    }
    if cli.trace_projections {
        executor.trace_projections();
    }
    if cli.trace_runtime {
        executor.trace_runtime();
    }

    let args: Vec<HostValue> = cli.args.iter().map(|a| parse_arg(a)).collect();
    let result = executor
        .run(&cli.file, &args)
        .into_diagnostic()
        .wrap_err("execution failed")?;

    match result {
        None => println!("null"),
        Some(RunResult::Value(HostValue::Int(i))) => println!("{i}"),
        Some(RunResult::Value(HostValue::Double(d))) => println!("{d}"),
        Some(RunResult::Value(HostValue::Bool(b))) => println!("{b}"),
        Some(RunResult::Value(HostValue::String(s))) => println!("{s}"),
        Some(RunResult::Counts(counts)) => {
            let rendered = serde_json::Value::Object(
                counts
                    .into_iter()
                    .map(|(key, count)| (key, serde_json::Value::from(count)))
                    .collect(),
            );
            println!("{rendered}");
        }
    }
    Ok(())
}
