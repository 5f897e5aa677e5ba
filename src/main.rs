//! PipelineKernel CLI Entry Point
//!
//! Runs a single plan file to completion against the in-process agent.
//!
//! # Usage
//!
//! ```bash
//! # Execute a plan
//! pipeline-kernel demos/pipeline.yaml
//!
//! # Tune the worker pool from a config file, override the worker count
//! pipeline-kernel demos/pipeline.yaml --config kernel.yaml --workers 8
//!
//! # Persist run state; an existing file is recovered before the plan starts
//! pipeline-kernel demos/pipeline.yaml --state-file /tmp/kernel-state.json
//!
//! # Abort the run after 200 ms
//! pipeline-kernel demos/pipeline.yaml --abort-after 200
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use pipeline_kernel::execution::{NodeExecution, PlanExecutionMetadata};
use pipeline_kernel::monitoring::ExecutionTimeline;
use pipeline_kernel::store::{load_snapshot, save_snapshot, InMemoryStore};
use pipeline_kernel::{
    load_plan, InterruptType, KernelBuilder, KernelConfig, Status, APP_NAME, VERSION,
};

/// Default plan file used when none is specified.
const DEFAULT_PLAN: &str = "pipeline.yaml";

/// Default time to wait for the plan to finish.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Args {
    plan_path: String,
    config_path: Option<PathBuf>,
    state_file: Option<PathBuf>,
    workers: Option<usize>,
    abort_after_ms: Option<u64>,
    timeout_secs: u64,
    verbose: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            plan_path: DEFAULT_PLAN.to_string(),
            config_path: None,
            state_file: None,
            workers: None,
            abort_after_ms: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Execution Orchestration Kernel");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: pipeline-kernel [OPTIONS] <PLAN_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAN_FILE>          Path to plan YAML file");
    println!();
    println!("Options:");
    println!("  --config PATH        Kernel configuration YAML");
    println!("  --workers N          Override the worker pool size");
    println!("  --state-file PATH    Load and save run state as JSON");
    println!("  --abort-after MS     Register an abort after MS milliseconds");
    println!("  --timeout SECS       Give up waiting after SECS (default: {})", DEFAULT_TIMEOUT_SECS);
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  pipeline-kernel demos/pipeline.yaml");
    println!("  pipeline-kernel demos/pipeline.yaml --workers 2 --abort-after 150");
}

fn option_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String, String> {
    args.get(i)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", flag, value))
}

/// Parses command-line arguments into an Args struct.
fn parse_arguments(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut seen_plan = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                parsed.verbose = true;
            }
            "--config" => {
                i += 1;
                parsed.config_path = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--state-file" => {
                i += 1;
                parsed.state_file = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--workers" => {
                i += 1;
                parsed.workers = Some(parse_number(option_value(args, i, arg)?, arg)?);
            }
            "--abort-after" => {
                i += 1;
                parsed.abort_after_ms = Some(parse_number(option_value(args, i, arg)?, arg)?);
            }
            "--timeout" => {
                i += 1;
                parsed.timeout_secs = parse_number(option_value(args, i, arg)?, arg)?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if seen_plan {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                parsed.plan_path = arg.clone();
                seen_plan = true;
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn colored_status(status: Status) -> colored::ColoredString {
    let label = status.as_str();
    match status {
        Status::Succeeded => label.green(),
        Status::Skipped => label.cyan(),
        Status::Failed | Status::Errored | Status::Expired => label.red(),
        Status::Aborted => label.yellow(),
        _ => label.normal(),
    }
}

/// Prints one line per node execution, indented by nesting depth.
fn print_summary(nodes: &[NodeExecution]) {
    println!();
    println!("{}", "Node executions:".bold());
    for node in nodes {
        let depth = node.ambiance.levels.len().saturating_sub(1);
        let retry = if node.old_retry { " (retried)" } else { "" };
        println!(
            "  {}{:<24} {}{}",
            "  ".repeat(depth),
            node.plan_node_id,
            colored_status(node.status),
            retry
        );
        if let Some(failure) = &node.failure_info {
            println!("  {}  {}", "  ".repeat(depth), failure.message.dimmed());
        }
    }
}

/// Main application entry point.
async fn run() -> Result<Status, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let args = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(args.verbose);
    print_banner();

    let mut config = match &args.config_path {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let restored = args.state_file.as_ref().filter(|path| path.exists());
    let store = match restored {
        Some(path) => {
            info!("Restoring run state from {}", path.display());
            Arc::new(load_snapshot(path)?)
        }
        None => Arc::new(InMemoryStore::new()),
    };

    let orchestrator = KernelBuilder::new(config)
        .with_store(store.clone())
        .start()?;

    if restored.is_some() {
        let report = orchestrator.recover()?;
        info!(
            "Recovery re-queued {} nodes across {} plan executions",
            report.restarted_nodes + report.reconciled_nodes,
            report.plan_executions
        );
    }

    info!("Loading plan: {}", args.plan_path);
    let plan = load_plan(&args.plan_path).map_err(|e| {
        error!("Failed to load plan: {}", e);
        format!("Could not load plan from '{}': {}", args.plan_path, e)
    })?;

    let plan_execution_id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual())?;

    if let Some(millis) = args.abort_after_ms {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        match orchestrator.register_interrupt(&plan_execution_id, InterruptType::Abort, None) {
            Ok(id) => info!("Registered abort interrupt {}", id),
            Err(e) => warn!("Abort not registered: {}", e),
        }
    }

    let execution = orchestrator
        .wait_for_plan(&plan_execution_id, Duration::from_secs(args.timeout_secs))
        .await?;

    let nodes = orchestrator.node_executions(&plan_execution_id)?;
    print_summary(&nodes);
    print!("{}", ExecutionTimeline::from_nodes(&nodes).gantt_chart());

    println!();
    println!("Plan execution {} finished as {}", execution.id, colored_status(execution.status));
    if let Some(end) = execution.end_ts {
        println!(
            "Total execution time: {} ms",
            (end - execution.start_ts).num_milliseconds()
        );
    }
    println!();

    orchestrator.shutdown().await;

    if let Some(path) = &args.state_file {
        save_snapshot(&store, path)?;
        info!("Saved run state to {}", path.display());
    }

    Ok(execution.status)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(Status::Succeeded) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
