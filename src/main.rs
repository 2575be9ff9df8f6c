//! FlowRunner CLI Entry Point
//!
//! Runs a workflow defined in YAML.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner workflow.yaml
//!
//! # Override the workflow input
//! flowrunner workflow.yaml --input '{"date": "2024-01-01"}'
//!
//! # Persist state so an interrupted run resumes where it stopped
//! flowrunner workflow.yaml --state-dir .flowrunner
//!
//! # Pause while /tmp/pause.flag exists
//! flowrunner workflow.yaml --pause-flag /tmp/pause.flag
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{debug, error, info, warn};
use serde_json::Value;

use flowrunner::{
    load_workflow, Event, ExecutionTimeline, FileStorage, Lifecycle, Status, Storage, Workflow,
    APP_NAME, VERSION,
};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Interval for checking the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    input: Option<Value>,
    state_dir: Option<PathBuf>,
    pause_flag_path: Option<PathBuf>,
    fresh: bool,
    timeline: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            input: None,
            state_dir: None,
            pause_flag_path: None,
            fresh: false,
            timeline: false,
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
    println!("Hierarchical Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>      Path to workflow YAML file (default: {})", DEFAULT_WORKFLOW);
    println!();
    println!("Options:");
    println!("  --input JSON         Workflow input (overrides the file's input)");
    println!("  --state-dir DIR      Persist state in DIR and resume from it");
    println!("  --fresh              Discard persisted state before running");
    println!("  --pause-flag PATH    Pause while PATH exists, resume when removed");
    println!("  --timeline           Print a Gantt chart of step timings");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner pipeline.yaml");
    println!("  flowrunner pipeline.yaml --input 5 --timeline");
    println!("  flowrunner pipeline.yaml --state-dir .flowrunner --pause-flag /tmp/pause.flag");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: usize, option: &str, what: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires {}", option, what))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
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
                config.verbose = true;
            }
            "--timeline" => {
                config.timeline = true;
            }
            "--fresh" => {
                config.fresh = true;
            }
            "--input" => {
                i += 1;
                let raw = option_value(args, i, "--input", "a JSON argument")?;
                // Bare words are taken as strings so `--input hello` works
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                config.input = Some(value);
            }
            "--state-dir" => {
                i += 1;
                let dir = option_value(args, i, "--state-dir", "a directory argument")?;
                config.state_dir = Some(PathBuf::from(dir));
            }
            "--pause-flag" => {
                i += 1;
                let path = option_value(args, i, "--pause-flag", "a path argument")?;
                config.pause_flag_path = Some(PathBuf::from(path));
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

/// Prints one line per lifecycle event.
fn print_event(event: &Event) {
    if event.lifecycle() == Lifecycle::Change {
        debug!("{} '{}' changed", event.level(), event.id());
        return;
    }

    let padded = format!("{:8}", event.lifecycle().as_str());
    let label = match event.lifecycle() {
        Lifecycle::Success => padded.as_str().green(),
        Lifecycle::Failed => padded.as_str().red().bold(),
        Lifecycle::Pause | Lifecycle::Stop => padded.as_str().yellow(),
        _ => padded.as_str().cyan(),
    };

    let indent = match event.level() {
        flowrunner::ComponentKind::Workflow => "",
        flowrunner::ComponentKind::Work => "  ",
        flowrunner::ComponentKind::Step => "    ",
    };

    match event.error() {
        Some(message) if event.lifecycle() == Lifecycle::Failed => {
            println!("{}{} {} {}: {}", indent, label, event.level(), event.id().bold(), message)
        }
        _ => println!("{}{} {} {}", indent, label, event.level(), event.id().bold()),
    }
}

/// Pauses the workflow while the flag file exists and resumes it once the
/// file is removed. Returns when the workflow settles.
async fn watch_pause_flag(workflow: Workflow, flag: PathBuf) {
    let mut interval = tokio::time::interval(PAUSE_CHECK_INTERVAL);
    loop {
        interval.tick().await;

        let status = workflow.status();
        if status.is_terminal() {
            return;
        }

        let flagged = flag.exists();
        if flagged && status == Status::Running {
            info!("Pause flag found - pausing execution");
            workflow.pause().await;
        } else if !flagged && status == Status::Paused {
            info!("Pause flag removed - resuming");
            workflow.resume().await;
        }
    }
}

fn print_summary(workflow: &Workflow) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = workflow.snapshot();
    println!();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!();

    let status = match snapshot.status {
        Status::Success => snapshot.status.as_str().green().bold(),
        Status::Failed => snapshot.status.as_str().red().bold(),
        _ => snapshot.status.as_str().yellow().bold(),
    };
    println!("Workflow '{}' finished: {}", snapshot.id, status);
    Ok(())
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let definition = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", config.workflow_path, e)
    })?;

    info!(
        "Workflow loaded: {} works, {} steps",
        definition.works.len(),
        definition.step_count()
    );

    let storage: Option<Arc<dyn Storage>> = match &config.state_dir {
        Some(dir) => {
            info!("State directory: {}", dir.display());
            Some(Arc::new(FileStorage::new(dir)))
        }
        None => None,
    };

    let workflow = definition.build(storage);

    if config.fresh {
        info!("Discarding persisted state");
        workflow.purge().await?;
    } else if config.state_dir.is_some() && workflow.auto_restore().await? {
        match workflow.status() {
            Status::Pending => info!("Resuming interrupted run"),
            status => warn!(
                "Workflow already finished ({}) - use --fresh to run it again",
                status
            ),
        }
    }

    workflow.on_any(print_event);

    let timeline = ExecutionTimeline::new();
    if config.timeline {
        timeline.attach(workflow.events());
    }

    if let Some(flag) = &config.pause_flag_path {
        info!("Pause control: {}", pause_flag_hint(flag));
        tokio::spawn(watch_pause_flag(workflow.clone(), flag.clone()));
    }

    let input = config
        .input
        .or_else(|| definition.input.clone())
        .unwrap_or(Value::Null);
    debug!("Workflow input: {}", input);

    println!();
    let result = workflow.run(input).await;

    print_summary(&workflow)?;
    if config.timeline {
        println!("{}", timeline.gantt_chart());
    }

    match result {
        Ok(snapshot) => Ok(snapshot.status == Status::Success),
        Err(e) => {
            error!("{}", e);
            Ok(false)
        }
    }
}

fn pause_flag_hint(path: &Path) -> String {
    format!("touch {} to pause, rm it to resume", path.display())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
