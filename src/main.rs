//! Paneflow CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow against the agents of session "main"
//! paneflow review.yaml
//!
//! # Another session, with input variables
//! paneflow review.yaml --session agents --var target=src/ --var depth=2
//!
//! # Dry run mode (route steps without sending prompts)
//! paneflow review.yaml --dry-run
//!
//! # Validate or show the execution plan only
//! paneflow review.yaml --validate
//! paneflow review.yaml --plan
//! ```

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use paneflow::execution::{ExecutionStatus, Executor, ExecutorConfig, ProgressEvent, ProgressKind};
use paneflow::monitoring::render_timeline;
use paneflow::workflow::{
    format_duration, parse_duration, read_workflow, validate_workflow, DependencyGraph, Workflow,
};
use paneflow::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Default terminal session.
const DEFAULT_SESSION: &str = "main";

/// Progress events buffered before new ones are dropped.
const PROGRESS_BUFFER: usize = 64;

/// Exit code for a run interrupted with Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    session: String,
    vars: HashMap<String, Value>,
    timeout: Option<Duration>,
    dry_run: bool,
    validate_only: bool,
    plan_only: bool,
    json: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            session: DEFAULT_SESSION.to_string(),
            vars: HashMap::new(),
            timeout: None,
            dry_run: false,
            validate_only: false,
            plan_only: false,
            json: false,
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
    println!("Workflow Executor for Terminal Agents");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: paneflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --session NAME      Terminal session hosting the agents (default: {})", DEFAULT_SESSION);
    println!("  --var KEY=VALUE     Set an input variable (repeatable; JSON values allowed)");
    println!("  --timeout DURATION  Global run timeout, e.g. 30m or 1h30m");
    println!("  --dry-run           Route steps without sending prompts");
    println!("  --validate          Validate the workflow and exit");
    println!("  --plan              Print the execution levels and exit");
    println!("  --json              Print the final execution state as JSON");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  paneflow review.yaml");
    println!("  paneflow review.yaml --session agents --var target=src/");
    println!("  paneflow review.yaml --plan");
}

/// Parses a `KEY=VALUE` pair. Values that parse as YAML keep their type.
fn parse_var(pair: &str) -> Result<(String, Value), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("Invalid variable '{}': expected KEY=VALUE", pair))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid variable '{}': empty name", pair));
    }
    let value = match serde_yaml::from_str::<Value>(value) {
        Ok(Value::Null) | Err(_) => Value::String(value.to_string()),
        Ok(parsed) => parsed,
    };
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    let value_of = |i: usize, flag: &str| -> Result<&String, String> {
        args.get(i).ok_or_else(|| format!("{} requires an argument", flag))
    };

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
            "--dry-run" => config.dry_run = true,
            "--validate" => config.validate_only = true,
            "--plan" => config.plan_only = true,
            "--json" => config.json = true,
            "--verbose" | "-v" => config.verbose = true,
            "--session" | "-s" => {
                i += 1;
                config.session = value_of(i, "--session")?.clone();
            }
            "--var" => {
                i += 1;
                let (key, value) = parse_var(value_of(i, "--var")?)?;
                config.vars.insert(key, value);
            }
            "--timeout" => {
                i += 1;
                let raw = value_of(i, "--timeout")?;
                config.timeout = Some(
                    parse_duration(raw).map_err(|e| format!("Invalid timeout '{}': {}", raw, e))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints validation results; returns true if the workflow is valid.
fn report_validation(workflow: &Workflow) -> bool {
    let report = validate_workflow(workflow);
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    for err in &report.errors {
        println!("  {} {}", "error:".red(), err);
    }
    if report.is_valid() {
        println!("{} '{}' is valid ({} steps)", "OK".green().bold(), workflow.name, workflow.len());
    }
    report.is_valid()
}

/// Prints the steps that can run at each level of the dependency graph.
fn print_plan(workflow: &Workflow) -> Result<(), String> {
    let graph = DependencyGraph::build(workflow).map_err(|issues| {
        issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    })?;

    println!("Execution plan for '{}':", workflow.name.bold());
    for (level, steps) in graph.levels().iter().enumerate() {
        println!("  Level {}: {}", level + 1, steps.join(", "));
    }
    Ok(())
}

/// Logs progress events as they arrive.
async fn log_progress(mut rx: mpsc::Receiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        let percent = (event.progress * 100.0).round();
        match event.kind {
            ProgressKind::StepError | ProgressKind::WorkflowError => {
                warn!("[{:>3}%] {}", percent, event.message)
            }
            _ => info!("[{:>3}%] {}", percent, event.message),
        }
    }
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    if !config.json {
        print_banner();
    }

    let workflow = read_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", config.workflow_path, e)
    })?;

    if config.validate_only {
        let valid = report_validation(&workflow);
        return Ok(if valid { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }
    if !validate_workflow(&workflow).is_valid() {
        report_validation(&workflow);
        return Ok(ExitCode::FAILURE);
    }
    if config.plan_only {
        print_plan(&workflow)?;
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        "Workflow '{}' loaded: {} steps, session '{}'",
        workflow.name,
        workflow.len(),
        config.session
    );
    if config.dry_run {
        info!("Mode: DRY RUN (prompts will not be sent)");
    }

    let mut executor_config = ExecutorConfig::for_session(&config.session);
    executor_config.set_dry_run(config.dry_run);
    if let Some(timeout) = config.timeout {
        executor_config.set_global_timeout(timeout);
    }
    let executor = Arc::new(Executor::with_tmux(executor_config));

    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    let progress_logger = tokio::spawn(log_progress(rx));

    let interrupt = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                executor.cancel();
            }
        })
    };

    let report = executor.run(&workflow, config.vars, Some(tx)).await;
    interrupt.abort();
    if let Err(e) = progress_logger.await {
        warn!("Progress logger stopped: {}", e);
    }

    let state = &report.state;
    if config.json {
        println!("{}", serde_json::to_string_pretty(state)?);
    } else {
        println!("{}", render_timeline(state));
        let elapsed = state
            .finished_at
            .and_then(|end| (end - state.started_at).to_std().ok())
            .unwrap_or_default();
        let status = match state.status {
            ExecutionStatus::Completed => state.status.as_str().green().bold(),
            ExecutionStatus::Cancelled => state.status.as_str().yellow().bold(),
            _ => state.status.as_str().red().bold(),
        };
        println!("Run {} {} in {}", state.run_id, status, format_duration(elapsed));
        for err in state.errors.iter().filter(|e| e.fatal) {
            let step = err.step_id.as_deref().unwrap_or("workflow");
            println!("  {} [{}] {}: {}", "error".red(), err.kind, step, err.message);
        }
    }

    Ok(match &report.error {
        None => ExitCode::SUCCESS,
        Some(e) if state.status == ExecutionStatus::Cancelled => {
            info!("{}", e);
            ExitCode::from(EXIT_CANCELLED)
        }
        Some(_) => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
